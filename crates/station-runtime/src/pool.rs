//! Bounded FIFO worker pool.
//!
//! N dedicated OS threads consume a bounded MPMC job queue; each thread owns
//! one capability-provider instance.  Enqueueing never blocks: a full queue
//! rejects immediately.  Waiting for a result is bounded by a per-request
//! timeout; an expired waiter abandons its completion channel and the
//! worker's late result is discarded.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::provider::{Args, CallOutput, CapabilityProvider, ProviderError};

/// How often an idle worker re-checks the running flag.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

enum Job {
    Call {
        function: String,
        args: Args,
        reply: oneshot::Sender<CallOutput>,
    },
    /// Wakes one worker during shutdown.
    Poison,
}

/// Outcome of a [`WorkerPool::submit`] call.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// The worker completed.  Provider errors arrive here too, wrapped as
    /// `{"status":"error","error":...}` values.
    Completed(CallOutput),
    /// The queue was full; nothing was enqueued.
    Rejected,
    /// The deadline elapsed first.  The worker may still finish later; its
    /// result is discarded.
    TimedOut,
}

/// Consistent single-lock snapshot of pool activity.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub queue_size: usize,
    pub max_queue_size: usize,
    pub processing: usize,
    pub timeouts: u64,
    pub default_timeout: f64,
}

#[derive(Default)]
struct Counters {
    processing: usize,
    timeouts: u64,
}

pub struct WorkerPool {
    job_tx: flume::Sender<Job>,
    counters: Arc<Mutex<Counters>>,
    running: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
    workers: usize,
    queue_capacity: usize,
    default_timeout: Duration,
}

impl WorkerPool {
    /// Spawn one worker thread per provider.
    pub fn start(
        providers: Vec<Box<dyn CapabilityProvider>>,
        queue_capacity: usize,
        default_timeout: Duration,
    ) -> Self {
        assert!(!providers.is_empty(), "worker pool needs at least one provider");

        let workers = providers.len();
        let (job_tx, job_rx) = flume::bounded::<Job>(queue_capacity);
        let counters = Arc::new(Mutex::new(Counters::default()));
        let running = Arc::new(AtomicBool::new(true));

        let handles = providers
            .into_iter()
            .enumerate()
            .map(|(worker_id, provider)| {
                let rx = job_rx.clone();
                let counters = Arc::clone(&counters);
                let running = Arc::clone(&running);
                std::thread::Builder::new()
                    .name(format!("station-worker-{worker_id}"))
                    .spawn(move || worker_loop(worker_id, provider, rx, counters, running))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        info!(workers, queue_capacity, "worker pool started");
        Self {
            job_tx,
            counters,
            running,
            handles,
            workers,
            queue_capacity,
            default_timeout,
        }
    }

    /// Enqueue a capability call and wait for its completion.
    ///
    /// Never blocks on a full queue and never waits past the effective
    /// timeout.
    pub async fn submit(
        &self,
        function: &str,
        timeout: Option<Duration>,
        args: Args,
    ) -> SubmitOutcome {
        if self.job_tx.is_full() {
            return SubmitOutcome::Rejected;
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Job::Call {
            function: function.to_owned(),
            args,
            reply: reply_tx,
        };
        if self.job_tx.try_send(job).is_err() {
            return SubmitOutcome::Rejected;
        }

        let effective = timeout.unwrap_or(self.default_timeout);
        match tokio::time::timeout(effective, reply_rx).await {
            Ok(Ok(output)) => SubmitOutcome::Completed(output),
            // The worker dropped the reply channel (pool shutting down).
            Ok(Err(_)) => SubmitOutcome::Completed(CallOutput::Value(json!({
                "status": "error",
                "error": "worker pool shut down before the request completed",
            }))),
            Err(_) => {
                self.counters.lock().expect("pool lock poisoned").timeouts += 1;
                SubmitOutcome::TimedOut
            }
        }
    }

    /// Snapshot of pool activity, taken under one lock.
    pub fn stats(&self) -> PoolStats {
        let counters = self.counters.lock().expect("pool lock poisoned");
        PoolStats {
            workers: self.workers,
            queue_size: self.job_tx.len(),
            max_queue_size: self.queue_capacity,
            processing: counters.processing,
            timeouts: counters.timeouts,
            default_timeout: self.default_timeout.as_secs_f64(),
        }
    }

    /// Stop accepting work and join every worker.  Queued jobs that no worker
    /// picked up are dropped; their waiters observe an error envelope.
    pub fn shutdown(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        self.running.store(false, Ordering::Release);
        for _ in 0..self.workers {
            // Full queue is fine; workers also poll the running flag.
            let _ = self.job_tx.try_send(Job::Poison);
        }
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread panicked during shutdown");
            }
        }
        info!("worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    worker_id: usize,
    mut provider: Box<dyn CapabilityProvider>,
    job_rx: flume::Receiver<Job>,
    counters: Arc<Mutex<Counters>>,
    running: Arc<AtomicBool>,
) {
    debug!(worker_id, "worker started");
    while running.load(Ordering::Acquire) {
        let job = match job_rx.recv_timeout(POLL_INTERVAL) {
            Ok(job) => job,
            Err(flume::RecvTimeoutError::Timeout) => continue,
            Err(flume::RecvTimeoutError::Disconnected) => break,
        };

        let (function, args, reply) = match job {
            Job::Poison => break,
            Job::Call {
                function,
                args,
                reply,
            } => (function, args, reply),
        };

        counters.lock().expect("pool lock poisoned").processing += 1;
        let output = run_capability(provider.as_mut(), &function, &args);
        // The receiver may have timed out and gone away; the result is
        // discarded in that case.
        let _ = reply.send(output);
        counters.lock().expect("pool lock poisoned").processing -= 1;
    }
    debug!(worker_id, "worker stopped");
}

/// Invoke the provider and normalize its result into the envelope contract:
/// mappings pass through, bare values are wrapped, errors and panics become
/// `{"status":"error"}` envelopes.
fn run_capability(
    provider: &mut dyn CapabilityProvider,
    function: &str,
    args: &Args,
) -> CallOutput {
    let result: Result<Result<CallOutput, ProviderError>, _> =
        catch_unwind(AssertUnwindSafe(|| provider.invoke(function, args)));

    match result {
        Ok(Ok(CallOutput::Value(value))) => {
            if value.is_object() {
                CallOutput::Value(value)
            } else {
                CallOutput::Value(json!({ "result": value }))
            }
        }
        Ok(Ok(stream @ CallOutput::Stream(_))) => stream,
        Ok(Err(e)) => CallOutput::Value(json!({
            "status": "error",
            "error": e.to_string(),
        })),
        Err(_) => CallOutput::Value(json!({
            "status": "error",
            "error": format!("capability '{function}' panicked"),
        })),
    }
}
