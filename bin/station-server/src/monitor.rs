//! Idle-shutdown monitor.
//!
//! Container deployments pay for every idle minute, so the gateway watches
//! pool activity and asks the host to terminate after a sustained quiet
//! period.  The monitor holds only a weak reference to the inference
//! service and no-ops when none is alive.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use station_runtime::InferenceService;

/// Abandon the monitor after this many consecutive failed stats reads.
const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// How long the external shutdown command may run.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on joining the monitor task at gateway stop.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Host-level termination.  Must be idempotent; the monitor invokes it at
/// most once per process lifetime.
#[async_trait]
pub trait HostShutdown: Send + Sync {
    async fn shutdown(&self) -> anyhow::Result<()>;
}

/// Stops the surrounding pod via `runpodctl`, identified by `RUNPOD_POD_ID`.
pub struct PodShutdown;

#[async_trait]
impl HostShutdown for PodShutdown {
    async fn shutdown(&self) -> anyhow::Result<()> {
        let pod_id = std::env::var("RUNPOD_POD_ID")
            .map_err(|_| anyhow::anyhow!("RUNPOD_POD_ID is not set"))?;

        info!(pod_id, "requesting host shutdown");
        let run = tokio::process::Command::new("runpodctl")
            .args(["stop", "pod", &pod_id])
            .output();
        let output = tokio::time::timeout(COMMAND_TIMEOUT, run)
            .await
            .map_err(|_| anyhow::anyhow!("shutdown command timed out"))??;

        if !output.status.success() {
            anyhow::bail!(
                "shutdown command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct IdleMonitorConfig {
    pub check_interval: Duration,
    pub idle_threshold: Duration,
}

/// Background watcher sampling pool stats on a fixed interval.
pub struct IdleMonitor {
    handle: JoinHandle<()>,
    stop_tx: watch::Sender<bool>,
}

impl IdleMonitor {
    pub fn spawn(
        config: IdleMonitorConfig,
        service: Weak<InferenceService>,
        host: Arc<dyn HostShutdown>,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run(config, service, host, stop_rx));
        Self { handle, stop_tx }
    }

    /// Signal the loop and join it within a bounded window.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if tokio::time::timeout(JOIN_TIMEOUT, self.handle).await.is_err() {
            warn!("idle monitor did not stop within the join timeout");
        }
    }
}

async fn run(
    config: IdleMonitorConfig,
    service: Weak<InferenceService>,
    host: Arc<dyn HostShutdown>,
    mut stop_rx: watch::Receiver<bool>,
) {
    info!(
        check_interval_s = config.check_interval.as_secs_f64(),
        idle_threshold_s = config.idle_threshold.as_secs_f64(),
        "idle monitor started"
    );

    let mut first_idle: Option<Instant> = None;
    let mut consecutive_errors: u32 = 0;

    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                info!("idle monitor stopping");
                return;
            }
            _ = tokio::time::sleep(config.check_interval) => {}
        }

        // The service has been dropped entirely: count as a failed read.
        let Some(service) = service.upgrade() else {
            consecutive_errors += 1;
            if consecutive_errors > MAX_CONSECUTIVE_ERRORS {
                warn!("idle monitor giving up after repeated stats failures");
                return;
            }
            continue;
        };
        consecutive_errors = 0;

        // No running pool: nothing to watch this tick.
        let Some((_, stats)) = service.stats().await else {
            continue;
        };

        if stats.queue_size == 0 && stats.processing == 0 {
            match first_idle {
                None => first_idle = Some(Instant::now()),
                Some(since) => {
                    let idle_for = since.elapsed();
                    if idle_for >= config.idle_threshold {
                        info!(idle_s = idle_for.as_secs_f64(), "idle threshold reached");
                        if let Err(e) = host.shutdown().await {
                            warn!(error = %e, "host shutdown command failed");
                        }
                        // One-shot by construction: the loop ends here whether
                        // or not the command succeeded.
                        return;
                    }
                }
            }
        } else {
            first_idle = None;
        }
    }
}
