//! Pool statistics endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// `GET /v1/stats`: pool snapshot plus the session request counter.
pub async fn get_stats(State(state): State<Arc<AppState>>) -> Json<Value> {
    let requests_processed = state.session.requests_processed();

    match state.service.stats().await {
        Some((model, pool)) => {
            let mut value = serde_json::to_value(&pool).unwrap_or_else(|_| json!({}));
            if let Some(map) = value.as_object_mut() {
                map.insert("model".into(), json!(model));
                map.insert("status".into(), json!("running"));
                map.insert("requests_processed".into(), json!(requests_processed));
            }
            Json(value)
        }
        None => Json(json!({
            "status": "stopped",
            "requests_processed": requests_processed,
        })),
    }
}
