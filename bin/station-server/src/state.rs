//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use station_manifest::ManifestStore;
use station_runtime::InferenceService;

use crate::analytics::Analytics;
use crate::config::ConfigStore;
use crate::session::SessionSink;

/// State shared across all HTTP handlers.
///
/// The gateway holds the inference service read-only; start/stop happen in
/// `main` around the server lifetime.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConfigStore>,
    pub manifest: Arc<ManifestStore>,
    pub service: Arc<InferenceService>,
    pub session: Arc<dyn SessionSink>,
    pub analytics: Arc<dyn Analytics>,
}
