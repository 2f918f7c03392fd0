//! Manifest store for Moondream Station.
//!
//! The manifest is a JSON document describing the models that can be served,
//! the backend each model runs on, and host-facing advisories.  This crate
//! owns fetching (with an offline disk cache), shape validation, and typed
//! read access.

mod error;
mod store;
mod types;

pub use error::ManifestError;
pub use store::ManifestStore;
pub use types::{
    AnalyticsConfig, BackendInfo, ManifestData, ModelInfo, StationInfo, VersionMessage,
};
