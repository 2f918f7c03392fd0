//! Health / heartbeat endpoint.

use axum::Json;
use serde_json::{json, Value};

/// Heartbeat endpoint.  Load-balancers and launchers poll this.
pub async fn get_health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "server": "moondream-station",
    }))
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn health_reports_ok() {
        let Json(body) = get_health().await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["server"], "moondream-station");
    }
}
