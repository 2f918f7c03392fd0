//! Inference runtime for Moondream Station.
//!
//! Three layers:
//! - [`provider`]: the capability-provider seam every backend implements,
//!   plus the registry that resolves manifest entry modules to factories.
//! - [`pool`]: a bounded FIFO queue feeding dedicated worker threads, each
//!   owning one provider instance.
//! - [`service`]: the start/stop lifecycle binding a model to a pool and
//!   routing capability calls.

mod dylib;
mod error;
mod pool;
mod provider;
mod service;
mod tests;

pub use dylib::{DylibProvider, DylibProviderFactory};
pub use error::StartError;
pub use pool::{PoolStats, SubmitOutcome, WorkerPool};
pub use provider::{
    Args, CallOutput, CapabilityProvider, ChunkStream, ProviderError, ProviderFactory,
    ProviderRegistry,
};
pub use service::{ExecuteOutcome, InferenceService, ServicePolicy};
