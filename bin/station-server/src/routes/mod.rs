//! Axum router construction.
//!
//! Three fixed routes plus a fallback that dispatches every other
//! method+path to the selected model's capabilities.  Layers (innermost
//! first): API-key auth, request tracing, permissive CORS.

mod dispatch;
mod health;
mod models;
mod stats;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the complete application [`Router`].
pub fn build(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_headers(Any)
        .allow_methods(Any);

    Router::new()
        .route("/health", get(health::get_health))
        .route("/v1/models", get(models::list_models))
        .route("/v1/stats", get(stats::get_stats))
        .fallback(dispatch::dynamic)
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            crate::middleware::require_api_key,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
