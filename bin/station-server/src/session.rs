//! Session-state collaborator.
//!
//! The gateway reports each successfully dispatched request here; the stats
//! endpoint reads the running total.  History persistence lives outside the
//! control plane.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

/// Interface the gateway records through.
pub trait SessionSink: Send + Sync {
    fn record_request(&self, path: &str);
    fn requests_processed(&self) -> u64;
}

/// In-memory session counters.
#[derive(Default)]
pub struct SessionState {
    requests: AtomicU64,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionSink for SessionState {
    fn record_request(&self, path: &str) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        debug!(path, "request recorded");
    }

    fn requests_processed(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}
