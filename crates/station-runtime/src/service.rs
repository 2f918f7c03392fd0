//! The inference service: binds a model, a worker pool, and per-worker
//! backend handles, and routes capability calls between them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{info, warn};

use station_manifest::ManifestStore;
use station_provision::Provisioner;

use crate::dylib::DylibProviderFactory;
use crate::error::StartError;
use crate::pool::{PoolStats, SubmitOutcome, WorkerPool};
use crate::provider::{Args, CallOutput, ProviderFactory, ProviderRegistry};

/// Pool sizing knobs, bound at service construction.
#[derive(Debug, Clone)]
pub struct ServicePolicy {
    pub workers: usize,
    pub queue_capacity: usize,
    pub default_timeout: Duration,
}

impl Default for ServicePolicy {
    fn default() -> Self {
        Self {
            workers: 1,
            queue_capacity: 10,
            default_timeout: Duration::from_secs(30),
        }
    }
}

/// Outcome of [`InferenceService::execute`].
///
/// Recoverable conditions are variants here rather than errors so the
/// gateway can map each one to a response uniformly.
#[derive(Debug)]
pub enum ExecuteOutcome {
    Completed(CallOutput),
    Rejected,
    TimedOut,
    NotRunning,
    UnknownFunction(String),
}

struct Active {
    model_id: String,
    /// Declared functions ∩ what the loaded providers actually expose.
    capabilities: Vec<String>,
    pool: WorkerPool,
}

/// Owns the worker pool and every backend handle for the selected model.
pub struct InferenceService {
    manifest: Arc<ManifestStore>,
    provisioner: Provisioner,
    registry: ProviderRegistry,
    policy: ServicePolicy,
    active: RwLock<Option<Active>>,
}

impl InferenceService {
    pub fn new(
        manifest: Arc<ManifestStore>,
        provisioner: Provisioner,
        registry: ProviderRegistry,
        policy: ServicePolicy,
    ) -> Self {
        Self {
            manifest,
            provisioner,
            registry,
            policy,
            active: RwLock::new(None),
        }
    }

    /// Resolve `model_id` to a provisioned backend, create one provider per
    /// worker, and start the pool.  A failed start leaves the service
    /// unstarted with no handles retained.
    pub async fn start(&self, model_id: &str) -> Result<(), StartError> {
        let mut slot = self.active.write().await;
        if slot.is_some() {
            return Err(StartError::AlreadyRunning);
        }

        let models = self.manifest.models();
        let model = models
            .get(model_id)
            .ok_or_else(|| StartError::UnknownModel(model_id.to_owned()))?;
        let backends = self.manifest.backends();
        let backend = backends
            .get(&model.backend)
            .ok_or_else(|| StartError::UnknownBackend {
                model: model_id.to_owned(),
                backend: model.backend.clone(),
            })?;

        let entry = self.provisioner.ensure(&model.backend, backend).await?;

        let factory: Arc<dyn ProviderFactory> = match self.registry.resolve(&backend.entry_module)
        {
            Some(factory) => factory,
            None => Arc::new(DylibProviderFactory::new(entry, backend.functions.clone())),
        };

        let mut providers = Vec::with_capacity(self.policy.workers);
        for worker_id in 0..self.policy.workers {
            providers.push(factory.create(worker_id, &model.args)?);
        }

        let capabilities: Vec<String> = providers[0]
            .capabilities()
            .into_iter()
            .filter(|name| backend.functions.contains(name))
            .collect();
        if capabilities.is_empty() {
            warn!(model_id, backend = %model.backend, "backend exposes none of its declared functions");
        }

        let pool = WorkerPool::start(
            providers,
            self.policy.queue_capacity,
            self.policy.default_timeout,
        );

        info!(model_id, backend = %model.backend, workers = self.policy.workers, "inference service started");
        *slot = Some(Active {
            model_id: model_id.to_owned(),
            capabilities,
            pool,
        });
        Ok(())
    }

    /// Shut the pool down and release every handle.  Safe when not started.
    pub async fn stop(&self) {
        let mut slot = self.active.write().await;
        if let Some(mut active) = slot.take() {
            active.pool.shutdown();
            info!(model_id = %active.model_id, "inference service stopped");
        }
    }

    /// Route one capability call to the pool.
    pub async fn execute(
        &self,
        function: &str,
        timeout: Option<Duration>,
        args: Args,
    ) -> ExecuteOutcome {
        let guard = self.active.read().await;
        let Some(active) = guard.as_ref() else {
            return ExecuteOutcome::NotRunning;
        };
        if !active.capabilities.iter().any(|name| name == function) {
            return ExecuteOutcome::UnknownFunction(function.to_owned());
        }

        match active.pool.submit(function, timeout, args).await {
            SubmitOutcome::Completed(output) => ExecuteOutcome::Completed(output),
            SubmitOutcome::Rejected => ExecuteOutcome::Rejected,
            SubmitOutcome::TimedOut => ExecuteOutcome::TimedOut,
        }
    }

    pub async fn is_running(&self) -> bool {
        self.active.read().await.is_some()
    }

    pub async fn current_model(&self) -> Option<String> {
        self.active.read().await.as_ref().map(|a| a.model_id.clone())
    }

    /// Pool stats plus the bound model id, when running.
    pub async fn stats(&self) -> Option<(String, PoolStats)> {
        self.active
            .read()
            .await
            .as_ref()
            .map(|a| (a.model_id.clone(), a.pool.stats()))
    }
}
