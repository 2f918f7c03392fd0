//! Unified gateway error type.
//!
//! Recoverable inference conditions (queue full, timeout, service down) map
//! to structured JSON responses here so every handler returns them the same
//! way.  Backend-level failures are *not* errors: they travel inside 200
//! envelopes per the control-plane contract.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    /// The inference service has no running pool.
    #[error("Inference service not running")]
    ServiceNotRunning,

    /// The pool rejected the request at the queue boundary.
    #[error("Queue is full")]
    QueueFull,

    /// The caller-side deadline elapsed.
    #[error("Request timeout")]
    Timeout,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ServerError::ServiceNotRunning => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "error": self.to_string() }),
            ),
            ServerError::QueueFull => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "error": self.to_string(), "status": "rejected" }),
            ),
            ServerError::Timeout => (
                StatusCode::GATEWAY_TIMEOUT,
                json!({ "error": self.to_string(), "status": "timeout" }),
            ),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_codes_match_contract() {
        assert_eq!(
            ServerError::ServiceNotRunning.into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ServerError::QueueFull.into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ServerError::Timeout.into_response().status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }
}
