//! Capability-provider seam.
//!
//! A provider supplies the named capability functions (`caption`, `query`,
//! `detect`, ...) for one model.  Every pool worker owns its own provider
//! instance; instances must not share mutable state, so a slow inference on
//! one worker never serializes the others.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;

/// Keyword arguments of one capability invocation.
pub type Args = Map<String, Value>;

/// A finite, non-restartable sequence of string chunks.
///
/// Produced by streaming capabilities; consumed exactly once.  Dropping the
/// stream closes it, which is how a client disconnect reaches the producer.
pub struct ChunkStream {
    key: String,
    rx: mpsc::Receiver<String>,
}

impl ChunkStream {
    pub fn new(key: impl Into<String>, rx: mpsc::Receiver<String>) -> Self {
        Self {
            key: key.into(),
            rx,
        }
    }

    /// Convenience constructor: a bounded channel whose receiving half is the
    /// stream.
    pub fn channel(key: impl Into<String>, capacity: usize) -> (mpsc::Sender<String>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(key, rx))
    }

    /// The result key this sequence was produced under (e.g. `caption`).
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn next(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Blocking variant for non-async consumers.
    pub fn blocking_next(&mut self) -> Option<String> {
        self.rx.blocking_recv()
    }

    pub fn into_parts(self) -> (String, mpsc::Receiver<String>) {
        (self.key, self.rx)
    }
}

impl fmt::Debug for ChunkStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkStream").field("key", &self.key).finish()
    }
}

/// Value produced by one capability invocation.
#[derive(Debug)]
pub enum CallOutput {
    /// A complete JSON value.  Mappings pass through to the caller as-is;
    /// the pool wraps anything else as `{"result": value}`.
    Value(Value),
    /// A mapping whose keyed field is produced incrementally.
    Stream(ChunkStream),
}

/// Errors a provider can raise.  These become `{"status":"error"}` envelopes
/// at the pool boundary; they are never thrown at HTTP callers.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{0}")]
    Invocation(String),

    #[error("capability '{0}' is not implemented")]
    Unsupported(String),

    #[error("provider failed to load: {0}")]
    Load(String),

    #[error("provider initialization failed: {0}")]
    Init(String),
}

/// A per-worker backend handle.
///
/// `invoke` runs on a pool worker thread and may block for the duration of
/// the inference.
pub trait CapabilityProvider: Send {
    /// Capability names this instance can serve.
    fn capabilities(&self) -> Vec<String>;

    fn invoke(&mut self, function: &str, args: &Args) -> Result<CallOutput, ProviderError>;
}

/// Creates independent provider instances, one per pool worker.
pub trait ProviderFactory: Send + Sync {
    fn create(
        &self,
        worker_id: usize,
        args: &Args,
    ) -> Result<Box<dyn CapabilityProvider>, ProviderError>;
}

/// Maps manifest `entry_module` names to in-process provider factories.
///
/// Backends without a registered factory fall back to dynamic loading of
/// their provisioned shared library.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    factories: HashMap<String, Arc<dyn ProviderFactory>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entry_module: impl Into<String>, factory: Arc<dyn ProviderFactory>) {
        self.factories.insert(entry_module.into(), factory);
    }

    pub fn resolve(&self, entry_module: &str) -> Option<Arc<dyn ProviderFactory>> {
        self.factories.get(entry_module).cloned()
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("entry_modules", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
