#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use serde_json::json;

    use station_manifest::ManifestStore;
    use station_provision::Provisioner;

    use crate::pool::{SubmitOutcome, WorkerPool};
    use crate::provider::{
        Args, CallOutput, CapabilityProvider, ChunkStream, ProviderError, ProviderFactory,
        ProviderRegistry,
    };
    use crate::service::{ExecuteOutcome, InferenceService, ServicePolicy};

    // ── Test providers ────────────────────────────────────────────────────────

    struct EchoProvider;

    impl CapabilityProvider for EchoProvider {
        fn capabilities(&self) -> Vec<String> {
            vec!["caption".into(), "count_tokens".into(), "boom".into()]
        }

        fn invoke(&mut self, function: &str, _args: &Args) -> Result<CallOutput, ProviderError> {
            match function {
                "caption" => Ok(CallOutput::Value(json!({ "caption": "a cat" }))),
                // Bare value; the pool must wrap it.
                "count_tokens" => Ok(CallOutput::Value(json!(7))),
                "boom" => panic!("backend exploded"),
                other => Err(ProviderError::Unsupported(other.to_owned())),
            }
        }
    }

    struct EchoFactory;

    impl ProviderFactory for EchoFactory {
        fn create(
            &self,
            _worker_id: usize,
            _args: &Args,
        ) -> Result<Box<dyn CapabilityProvider>, ProviderError> {
            Ok(Box::new(EchoProvider))
        }
    }

    /// Blocks for a configured delay, logging the `tag` argument on entry.
    struct SlowProvider {
        delay: Duration,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl CapabilityProvider for SlowProvider {
        fn capabilities(&self) -> Vec<String> {
            vec!["slow".into()]
        }

        fn invoke(&mut self, _function: &str, args: &Args) -> Result<CallOutput, ProviderError> {
            let tag = args
                .get("tag")
                .and_then(|v| v.as_str())
                .unwrap_or("?")
                .to_owned();
            self.log.lock().unwrap().push(tag);
            std::thread::sleep(self.delay);
            Ok(CallOutput::Value(json!({ "done": true })))
        }
    }

    struct StreamProvider;

    impl CapabilityProvider for StreamProvider {
        fn capabilities(&self) -> Vec<String> {
            vec!["caption".into()]
        }

        fn invoke(&mut self, _function: &str, _args: &Args) -> Result<CallOutput, ProviderError> {
            let (tx, stream) = ChunkStream::channel("caption", 8);
            for chunk in ["a", "b", "c"] {
                tx.try_send(chunk.to_owned()).unwrap();
            }
            Ok(CallOutput::Stream(stream))
        }
    }

    fn echo_pool(workers: usize) -> WorkerPool {
        let providers = (0..workers)
            .map(|_| Box::new(EchoProvider) as Box<dyn CapabilityProvider>)
            .collect();
        WorkerPool::start(providers, 10, Duration::from_secs(5))
    }

    fn slow_pool(
        delay: Duration,
        queue_capacity: usize,
        default_timeout: Duration,
    ) -> (WorkerPool, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let provider = Box::new(SlowProvider {
            delay,
            log: Arc::clone(&log),
        }) as Box<dyn CapabilityProvider>;
        (
            WorkerPool::start(vec![provider], queue_capacity, default_timeout),
            log,
        )
    }

    fn args(pairs: &[(&str, serde_json::Value)]) -> Args {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    fn expect_value(outcome: SubmitOutcome) -> serde_json::Value {
        match outcome {
            SubmitOutcome::Completed(CallOutput::Value(value)) => value,
            other => panic!("expected a completed value, got {other:?}"),
        }
    }

    // ── Pool tests ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn mapping_results_pass_through() {
        let mut pool = echo_pool(1);
        let value = expect_value(pool.submit("caption", None, Args::new()).await);
        assert_eq!(value["caption"], "a cat");
        pool.shutdown();
    }

    #[tokio::test]
    async fn bare_values_are_wrapped() {
        let mut pool = echo_pool(1);
        let value = expect_value(pool.submit("count_tokens", None, Args::new()).await);
        assert_eq!(value["result"], 7);
        pool.shutdown();
    }

    #[tokio::test]
    async fn provider_errors_become_envelopes() {
        let mut pool = echo_pool(1);
        let value = expect_value(pool.submit("nope", None, Args::new()).await);
        assert_eq!(value["status"], "error");
        assert!(value["error"].as_str().unwrap().contains("nope"));
        pool.shutdown();
    }

    #[tokio::test]
    async fn panics_become_envelopes_and_pool_survives() {
        let mut pool = echo_pool(1);
        let value = expect_value(pool.submit("boom", None, Args::new()).await);
        assert_eq!(value["status"], "error");

        // Processing must have been balanced back to zero and the worker must
        // still serve requests.
        assert_eq!(pool.stats().processing, 0);
        let value = expect_value(pool.submit("caption", None, Args::new()).await);
        assert_eq!(value["caption"], "a cat");
        pool.shutdown();
    }

    #[tokio::test]
    async fn full_queue_rejects_immediately() {
        let (pool, _log) = slow_pool(Duration::from_millis(300), 1, Duration::from_secs(60));
        let pool = Arc::new(pool);

        // First request occupies the worker; second fills the queue.
        let first = {
            let pool = Arc::clone(&pool);
            tokio::spawn(
                async move { pool.submit("slow", None, args(&[("tag", json!("a"))])).await },
            )
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = {
            let pool = Arc::clone(&pool);
            tokio::spawn(
                async move { pool.submit("slow", None, args(&[("tag", json!("b"))])).await },
            )
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Queue holds one entry; a third submission is rejected at once.
        let started = Instant::now();
        let third = pool.submit("slow", None, args(&[("tag", json!("c"))])).await;
        assert!(matches!(third, SubmitOutcome::Rejected), "got {third:?}");
        assert!(
            started.elapsed() < Duration::from_millis(100),
            "rejection must not block"
        );

        // Both accepted requests run to completion.
        let first = first.await.unwrap();
        assert_eq!(expect_value(first)["done"], true);
        let second = second.await.unwrap();
        assert_eq!(expect_value(second)["done"], true);
    }

    #[tokio::test]
    async fn timeout_counts_and_discards_late_result() {
        let (mut pool, log) = slow_pool(Duration::from_millis(300), 4, Duration::from_secs(5));

        let outcome = pool
            .submit(
                "slow",
                Some(Duration::from_millis(50)),
                args(&[("tag", json!("late"))]),
            )
            .await;
        assert!(matches!(outcome, SubmitOutcome::TimedOut), "got {outcome:?}");
        assert_eq!(pool.stats().timeouts, 1);

        // The worker keeps running and finishes; its result has nowhere to go.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(log.lock().unwrap().as_slice(), ["late"]);
        assert_eq!(pool.stats().processing, 0);
        pool.shutdown();
    }

    #[tokio::test]
    async fn enqueue_order_is_fifo() {
        let (pool, log) = slow_pool(Duration::from_millis(120), 8, Duration::from_secs(5));
        let pool = Arc::new(pool);

        let mut handles = Vec::new();
        for tag in ["a", "b", "c"] {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move {
                pool.submit("slow", None, args(&[("tag", json!(tag))])).await
            }));
            // Give each submission time to enqueue before the next.
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        for handle in handles {
            let outcome = handle.await.unwrap();
            assert!(matches!(outcome, SubmitOutcome::Completed(_)));
        }

        assert_eq!(log.lock().unwrap().as_slice(), ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn stream_chunks_arrive_in_order() {
        let providers = vec![Box::new(StreamProvider) as Box<dyn CapabilityProvider>];
        let mut pool = WorkerPool::start(providers, 4, Duration::from_secs(5));

        let outcome = pool.submit("caption", None, Args::new()).await;
        let SubmitOutcome::Completed(CallOutput::Stream(mut stream)) = outcome else {
            panic!("expected a stream");
        };
        assert_eq!(stream.key(), "caption");
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk);
        }
        assert_eq!(chunks, ["a", "b", "c"]);
        pool.shutdown();
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let mut pool = echo_pool(2);
        pool.shutdown();
        pool.shutdown();
    }

    // ── Service tests ─────────────────────────────────────────────────────────

    const ENTRY_MODULE: &str = "echo_backend";

    fn tempdir(tag: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "station_runtime_{tag}_{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .subsec_nanos()
        ));
        std::fs::create_dir_all(&path).unwrap();
        path
    }

    async fn service_fixture(tag: &str, policy: ServicePolicy) -> (InferenceService, PathBuf) {
        let root = tempdir(tag);

        // A local backend source containing only the entry artifact.
        let source = root.join("source");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(
            source.join(libloading::library_filename(ENTRY_MODULE)),
            b"placeholder",
        )
        .unwrap();

        let manifest_json = json!({
            "version": "1.0.0",
            "models": {
                "m0": {
                    "name": "Moondream 2", "description": "vlm",
                    "backend": "b0", "is_default": true
                }
            },
            "backends": {
                "b0": {
                    "name": "echo",
                    "download_url": source.to_str().unwrap(),
                    "entry_module": ENTRY_MODULE,
                    "functions": ["caption", "count_tokens", "boom"]
                }
            }
        });
        let manifest_path = root.join("manifest.json");
        std::fs::write(&manifest_path, manifest_json.to_string()).unwrap();

        let manifest = Arc::new(ManifestStore::new(root.join("models")));
        manifest.load(manifest_path.to_str().unwrap()).await.unwrap();

        let mut registry = ProviderRegistry::new();
        registry.register(ENTRY_MODULE, Arc::new(EchoFactory));

        let service = InferenceService::new(
            manifest,
            Provisioner::new(root.join("models").join("backends")),
            registry,
            policy,
        );
        (service, root)
    }

    #[tokio::test]
    async fn start_execute_stop_round_trip() {
        let (service, root) = service_fixture("roundtrip", ServicePolicy::default()).await;
        assert!(!service.is_running().await);

        service.start("m0").await.expect("start should succeed");
        assert!(service.is_running().await);
        assert_eq!(service.current_model().await.as_deref(), Some("m0"));

        let outcome = service.execute("caption", None, Args::new()).await;
        let ExecuteOutcome::Completed(CallOutput::Value(value)) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(value["caption"], "a cat");

        service.stop().await;
        assert!(!service.is_running().await);
        std::fs::remove_dir_all(root).ok();
    }

    #[tokio::test]
    async fn execute_before_start_reports_not_running() {
        let (service, root) = service_fixture("notrunning", ServicePolicy::default()).await;
        let outcome = service.execute("caption", None, Args::new()).await;
        assert!(matches!(outcome, ExecuteOutcome::NotRunning));
        std::fs::remove_dir_all(root).ok();
    }

    #[tokio::test]
    async fn unknown_function_is_reported_without_enqueuing() {
        let (service, root) = service_fixture("unknownfn", ServicePolicy::default()).await;
        service.start("m0").await.unwrap();

        let outcome = service.execute("definitely_not_there", None, Args::new()).await;
        assert!(matches!(outcome, ExecuteOutcome::UnknownFunction(_)));

        // Nothing reached the queue.
        let (_, stats) = service.stats().await.unwrap();
        assert_eq!(stats.queue_size, 0);
        assert_eq!(stats.processing, 0);

        service.stop().await;
        std::fs::remove_dir_all(root).ok();
    }

    #[tokio::test]
    async fn unknown_model_fails_start() {
        let (service, root) = service_fixture("unknownmodel", ServicePolicy::default()).await;
        assert!(service.start("ghost").await.is_err());
        assert!(!service.is_running().await);
        std::fs::remove_dir_all(root).ok();
    }

    #[tokio::test]
    async fn double_start_requires_stop() {
        let (service, root) = service_fixture("doublestart", ServicePolicy::default()).await;
        service.start("m0").await.unwrap();
        assert!(service.start("m0").await.is_err());

        service.stop().await;
        service.start("m0").await.expect("restart after stop");
        service.stop().await;
        std::fs::remove_dir_all(root).ok();
    }

    #[tokio::test]
    async fn stats_report_model_and_pool_shape() {
        let policy = ServicePolicy {
            workers: 2,
            queue_capacity: 5,
            default_timeout: Duration::from_secs(12),
        };
        let (service, root) = service_fixture("stats", policy).await;
        assert!(service.stats().await.is_none());

        service.start("m0").await.unwrap();
        let (model, stats) = service.stats().await.unwrap();
        assert_eq!(model, "m0");
        assert_eq!(stats.workers, 2);
        assert_eq!(stats.max_queue_size, 5);
        assert_eq!(stats.default_timeout, 12.0);
        assert_eq!(stats.timeouts, 0);

        service.stop().await;
        std::fs::remove_dir_all(root).ok();
    }
}
