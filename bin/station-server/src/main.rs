//! station-server – entry point.
//!
//! Startup order:
//! 1. Initialise structured tracing (`LOG_LEVEL`, `RUST_LOG`).
//! 2. Load the persistent config store and apply environment overrides.
//! 3. Load the manifest (fresh fetch, cache fallback).
//! 4. Pick the model: configured `current_model` or the platform default.
//! 5. Start the inference service (provision backend, spawn the pool).
//! 6. Spawn the idle-shutdown monitor when enabled.
//! 7. Serve HTTP with graceful shutdown; tear everything down in order.

mod analytics;
mod config;
mod error;
mod middleware;
mod monitor;
mod routes;
mod session;
mod state;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::json;
use tracing::{info, warn};

use station_manifest::ManifestStore;
use station_provision::Provisioner;
use station_runtime::{InferenceService, ProviderRegistry, ServicePolicy};

use crate::analytics::{Analytics, NoopAnalytics, TracingAnalytics};
use crate::config::ConfigStore;
use crate::monitor::{IdleMonitor, IdleMonitorConfig, PodShutdown};
use crate::session::SessionState;
use crate::state::AppState;

const DEFAULT_MANIFEST_PATH: &str = "/local_manifest.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Tracing ─────────────────────────────────────────────────────────────
    init_tracing();
    info!(version = env!("CARGO_PKG_VERSION"), "station-server starting");

    // ── 2. Configuration ───────────────────────────────────────────────────────
    let home = dirs_next::home_dir().unwrap_or_else(|| PathBuf::from("."));
    let config = Arc::new(ConfigStore::load(home.join(".moondream-station")));
    config.apply_env_overrides();

    // ── 3. Manifest ────────────────────────────────────────────────────────────
    let manifest = Arc::new(ManifestStore::new(config.models_dir()));
    let manifest_source =
        std::env::var("MDS_MANIFEST_PATH").unwrap_or_else(|_| DEFAULT_MANIFEST_PATH.to_owned());
    manifest
        .load(&manifest_source)
        .await
        .context("failed to load manifest")?;

    if let Some(welcome) = manifest.messages().get("welcome") {
        info!(message = %welcome, "manifest welcome");
    }
    for advisory in manifest.version_messages(env!("CARGO_PKG_VERSION")) {
        match advisory.severity.as_str() {
            "warning" => warn!(message = %advisory.message, "manifest advisory"),
            _ => info!(message = %advisory.message, "manifest advisory"),
        }
    }

    // ── 4. Model selection ─────────────────────────────────────────────────────
    let model = match config
        .current_model()
        .filter(|m| manifest.models().contains_key(m))
    {
        Some(model) => model,
        None => manifest
            .available_default_model()
            .context("no default model available for this platform")?,
    };
    config.set("current_model", json!(model));

    // ── 5. Inference service ───────────────────────────────────────────────────
    let policy = ServicePolicy {
        workers: config.inference_workers(),
        queue_capacity: config.inference_max_queue_size(),
        default_timeout: Duration::from_secs_f64(config.inference_timeout()),
    };
    let provisioner = Provisioner::new(config.models_dir().join("backends"));
    let service = Arc::new(InferenceService::new(
        Arc::clone(&manifest),
        provisioner,
        ProviderRegistry::new(),
        policy,
    ));
    service
        .start(&model)
        .await
        .with_context(|| format!("failed to start inference service for model '{model}'"))?;

    // ── 6. Shared state + router ───────────────────────────────────────────────
    let analytics: Arc<dyn Analytics> = if config.logging_enabled() {
        Arc::new(TracingAnalytics)
    } else {
        Arc::new(NoopAnalytics)
    };
    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        manifest: Arc::clone(&manifest),
        service: Arc::clone(&service),
        session: Arc::new(SessionState::new()),
        analytics,
    });
    let app = routes::build(Arc::clone(&state));

    // ── 7. Idle-shutdown monitor ───────────────────────────────────────────────
    let monitor = config.shutdown_monitor_enabled().then(|| {
        IdleMonitor::spawn(
            IdleMonitorConfig {
                check_interval: Duration::from_secs_f64(config.shutdown_check_interval()),
                idle_threshold: Duration::from_secs_f64(config.shutdown_timeout()),
            },
            Arc::downgrade(&service),
            Arc::new(PodShutdown),
        )
    });

    // ── 8. HTTP server with graceful shutdown ──────────────────────────────────
    let addr = format!("{}:{}", config.service_host(), config.service_port());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, model = %model, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(monitor) = monitor {
        monitor.stop().await;
    }
    service.stop().await;

    info!("station-server stopped");
    Ok(())
}

/// Build the log filter, warning loudly when `LOG_LEVEL` is not a valid
/// tracing filter expression.
fn init_tracing() {
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
            match level.to_lowercase().parse::<tracing_subscriber::EnvFilter>() {
                Ok(filter) => filter,
                Err(e) => {
                    eprintln!(
                        "WARN: LOG_LEVEL='{level}' is not a valid tracing filter ({e}); \
                         falling back to 'info'"
                    );
                    tracing_subscriber::EnvFilter::new("info")
                }
            }
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();
}

/// Resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}
