//! Model listing endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// `GET /v1/models`: every model the manifest knows about.
pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<Value> {
    let mut entries: Vec<_> = state.manifest.models().into_iter().collect();
    entries.sort_by(|(a, _), (b, _)| a.cmp(b));

    let models: Vec<Value> = entries
        .into_iter()
        .map(|(id, info)| {
            json!({
                "id": id,
                "name": info.name,
                "description": info.description,
                "version": info.version,
            })
        })
        .collect();

    Json(json!({ "models": models }))
}
