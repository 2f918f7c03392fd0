//! Analytics collaborator.
//!
//! The gateway records per-request telemetry through this trait.  Uploading
//! is an outer-layer concern; the in-tree implementations either drop the
//! events or emit them as structured log records under the `analytics`
//! target so an external shipper can pick them up.

use std::time::Duration;

/// Per-request telemetry sink.  Implementations must never block the
/// request path.
pub trait Analytics: Send + Sync {
    fn track_api_call(
        &self,
        endpoint: &str,
        duration: Duration,
        tokens: u64,
        success: bool,
        model: Option<&str>,
    );

    fn track_error(&self, kind: &str, message: &str, context: &str);
}

/// Discards everything; used when no analytics are configured.
pub struct NoopAnalytics;

impl Analytics for NoopAnalytics {
    fn track_api_call(
        &self,
        _endpoint: &str,
        _duration: Duration,
        _tokens: u64,
        _success: bool,
        _model: Option<&str>,
    ) {
    }

    fn track_error(&self, _kind: &str, _message: &str, _context: &str) {}
}

/// Emits telemetry as `tracing` records.
pub struct TracingAnalytics;

impl Analytics for TracingAnalytics {
    fn track_api_call(
        &self,
        endpoint: &str,
        duration: Duration,
        tokens: u64,
        success: bool,
        model: Option<&str>,
    ) {
        tracing::info!(
            target: "analytics",
            endpoint,
            duration_ms = duration.as_millis() as u64,
            tokens,
            success,
            model = model.unwrap_or("-"),
            "api_call"
        );
    }

    fn track_error(&self, kind: &str, message: &str, context: &str) {
        tracing::warn!(target: "analytics", kind, message, context, "api_error");
    }
}
