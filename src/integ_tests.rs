//! Integration tests for primary and worker context behavior
//!
//! These tests run a primary and several workers inside one process, talking
//! over a real Unix socket and leasing devices from real lock files, to test
//! end to end scenarios of a distributed run.

#[cfg(test)]
mod tests {
    use crate::{
        coordination::{
            ContextDependenciesBuilder, PrimaryContext, RunContext, SetupOptions,
            StaticConfigResolver, WorkerContext,
        },
        devices::{
            AllocationDriver, DeviceConfig, DeviceCookie, DeviceRegistry, DeviceType, Platform,
            StaticPoolDriver,
        },
        error::OrchestratorError,
        logs::{DebugFormatOptions, LogLevel, LogRecord},
        runner::merge_logs,
        session::{LogPluginConfig, RunConfig},
    };
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    // ============ Test Helpers ============

    /// Paths and names isolating one test's run from every other test
    struct RunFixture {
        dir: TempDir,
        snapshot_env_var: String,
    }

    impl RunFixture {
        fn new() -> Self {
            Self {
                dir: TempDir::new().unwrap(),
                snapshot_env_var: format!("E2E_INTEG_SNAPSHOT_{}", uuid::Uuid::new_v4().simple()),
            }
        }

        fn registry_dir(&self) -> PathBuf {
            self.dir.path().join("locks")
        }

        fn log_dir(&self) -> PathBuf {
            self.dir.path().join("logs")
        }

        fn artifacts_dir(&self) -> PathBuf {
            self.dir.path().join("artifacts")
        }

        fn primary(&self, config: RunConfig, driver: Arc<dyn AllocationDriver>) -> PrimaryContext {
            let deps = ContextDependenciesBuilder::default()
                .config_resolver(Arc::new(StaticConfigResolver::new(config)))
                .allocation_driver(driver)
                .registry_dir(self.registry_dir())
                .log_dir(self.log_dir())
                .snapshot_env_var(self.snapshot_env_var.clone())
                .ipc_server_id(format!("integ-{}", uuid::Uuid::new_v4().simple()))
                .command_line("e2e-conductor run --workers 2")
                .install_signal_hook(false)
                .build()
                .unwrap();
            PrimaryContext::new(deps).unwrap()
        }

        fn worker(&self) -> WorkerContext {
            WorkerContext::new(&self.log_dir(), self.registry_dir(), Arc::new(StaticPoolDriver))
                .unwrap()
                .with_snapshot_env_var(self.snapshot_env_var.clone())
                .with_config_timeout(Duration::from_secs(2))
        }
    }

    /// Config leasing from `pool` and merging logs into the fixture's artifacts dir
    fn pooled_config(fixture: &RunFixture, device_type: DeviceType, pool: &[&str]) -> RunConfig {
        let mut config = RunConfig::default();
        config.device = DeviceConfig {
            device_type,
            pool: pool.iter().map(|id| id.to_string()).collect(),
            allocation_timeout_ms: Some(300),
        };
        config.artifacts.root_dir = Some(fixture.artifacts_dir());
        config.artifacts.plugins.log = LogPluginConfig::Preset("all".to_string());
        config
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !condition() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached in time"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn read_records(path: &Path) -> Vec<LogRecord> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    fn raw_logs_in(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .map(|e| e.unwrap().path())
                    .filter(|p| p.to_string_lossy().ends_with(".log.jsonl"))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[derive(Default)]
    struct ShutdownCounter {
        shutdowns: AtomicUsize,
    }

    #[async_trait]
    impl AllocationDriver for ShutdownCounter {
        async fn candidates(&self, config: &DeviceConfig) -> anyhow::Result<Vec<String>> {
            Ok(config.pool.clone())
        }

        async fn shutdown(&self, _cookie: &DeviceCookie) -> anyhow::Result<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    // ============ End-to-End Runs ============

    #[tokio::test]
    async fn test_two_workers_lease_distinct_devices_and_merge_logs() {
        let fixture = RunFixture::new();
        let config = pooled_config(
            &fixture,
            DeviceType::AndroidEmulator,
            &["emulator-5554", "emulator-5556"],
        );
        let mut primary = fixture.primary(config, Arc::new(StaticPoolDriver));
        primary.global_setup().await.unwrap();

        let mut first = fixture.worker();
        let mut second = fixture.worker();
        let (a, b) = tokio::join!(
            first.setup(SetupOptions::worker(1)),
            second.setup(SetupOptions::worker(2))
        );
        a.unwrap();
        b.unwrap();

        let first_device = first.device().unwrap().id.clone();
        let second_device = second.device().unwrap().id.clone();
        assert_ne!(first_device, second_device);
        assert_eq!(first.device().unwrap().platform, Platform::Android);

        // Every worker eventually observes the highest registered index
        wait_until(|| first.workers_count() == 2 && second.workers_count() == 2).await;
        assert_eq!(primary.ipc_server().unwrap().workers_count(), 2);

        first
            .log_to_primary(&LogRecord::new(
                LogLevel::Info,
                serde_json::Map::new(),
                vec![serde_json::json!("login.test.js passed")],
            ))
            .await
            .unwrap();
        let ipc = primary.ipc_server().unwrap();
        wait_until(|| ipc.stats().log_records == 1).await;
        second
            .report_failed_tests(vec!["checkout.test.js".to_string()], false)
            .await
            .unwrap();
        wait_until(|| !primary.failed_tests().is_empty()).await;

        first.teardown().await.unwrap();
        second.teardown().await.unwrap();

        let registry = DeviceRegistry::for_platform(&fixture.registry_dir(), Platform::Android);
        assert!(registry.busy_devices().await.unwrap().is_empty());

        let report = primary.global_teardown().await.unwrap();
        assert_eq!(report.failed_tests.test_file_paths, vec!["checkout.test.js"]);
        assert!(!report.failed_tests.permanent);
        assert!(report.merge_error.is_none());

        let summary = report.merge.unwrap();
        assert!(!summary.skipped);
        assert_eq!(summary.sources.len(), 3);
        assert!(summary.records > 0);

        let artifacts = fixture.artifacts_dir();
        assert!(artifacts.join("e2e.log").exists());
        assert!(artifacts.join("e2e.trace.json").exists());

        let merged = read_records(&artifacts.join("e2e.log.jsonl"));
        assert_eq!(merged.len() as u64, summary.records);
        // The lifecycle span opened by global setup precedes everything else
        assert_eq!(merged[0].meta_str("ph"), Some("B"));
        assert_eq!(merged[0].meta_str("cat"), Some("lifecycle"));
        // Shipped records land only in the primary's log
        assert_eq!(
            merged
                .iter()
                .filter(|r| r.message() == "login.test.js passed")
                .count(),
            1
        );
        assert!(merged.iter().any(|r| r.message() == "Worker 2 ready"));

        // Raw per-process logs are consumed by a successful merge
        assert!(raw_logs_in(&fixture.log_dir()).is_empty());
    }

    #[tokio::test]
    async fn test_busy_pool_times_out_then_frees() {
        let fixture = RunFixture::new();
        let config = pooled_config(&fixture, DeviceType::IosSimulator, &["iPhone 15"]);
        let mut primary = fixture.primary(config, Arc::new(StaticPoolDriver));
        primary.global_setup().await.unwrap();

        let mut holder = fixture.worker();
        holder.setup(SetupOptions::worker(1)).await.unwrap();
        assert_eq!(holder.device().unwrap().id, "iPhone 15");

        let mut waiting = fixture.worker();
        let err = waiting.setup(SetupOptions::worker(2)).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::DeviceUnavailable { .. }));
        waiting.teardown().await.unwrap();

        holder.teardown().await.unwrap();

        let mut next = fixture.worker();
        next.setup(SetupOptions::worker(3)).await.unwrap();
        assert_eq!(next.device().unwrap().id, "iPhone 15");
        next.teardown().await.unwrap();

        primary.global_teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_device_on_free() {
        let fixture = RunFixture::new();
        let mut config = pooled_config(&fixture, DeviceType::AndroidGenycloud, &["gmsaas-1"]);
        config.behavior.cleanup.shutdown_device = true;

        let driver = Arc::new(ShutdownCounter::default());
        let mut primary = fixture.primary(config, driver.clone());
        primary.global_setup().await.unwrap();

        primary.setup(SetupOptions::worker(1)).await.unwrap();
        assert_eq!(primary.device().unwrap().id, "gmsaas-1");

        primary.teardown().await.unwrap();
        primary.teardown().await.unwrap();
        assert_eq!(driver.shutdowns.load(Ordering::SeqCst), 1);

        primary.global_teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_setup_without_session_fails() {
        let fixture = RunFixture::new();
        let mut worker = fixture.worker();

        let err = worker.setup(SetupOptions::worker(1)).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Configuration(_)));
        assert!(worker.session().is_none());
    }

    #[tokio::test]
    async fn test_worker_index_zero_rejected() {
        let fixture = RunFixture::new();
        let mut primary = fixture.primary(RunConfig::default(), Arc::new(StaticPoolDriver));
        primary.global_setup().await.unwrap();

        let mut worker = fixture.worker();
        let err = worker.setup(SetupOptions::worker(0)).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Configuration(_)));

        primary.global_teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_logs_disabled_leaves_raw_files() {
        let fixture = RunFixture::new();
        let mut primary = fixture.primary(RunConfig::default(), Arc::new(StaticPoolDriver));
        primary.global_setup().await.unwrap();

        let mut worker = fixture.worker();
        worker.setup(SetupOptions::worker(1)).await.unwrap();
        assert!(worker.device().is_none());
        worker.teardown().await.unwrap();

        let report = primary.global_teardown().await.unwrap();
        assert!(report.merge.is_none());
        assert_eq!(raw_logs_in(&fixture.log_dir()).len(), 2);
    }

    #[tokio::test]
    async fn test_emergency_teardown_keeps_raw_logs_for_recovery() {
        let fixture = RunFixture::new();
        let config = pooled_config(&fixture, DeviceType::Stub, &[]);
        let mut primary = fixture.primary(config, Arc::new(StaticPoolDriver));
        primary.global_setup().await.unwrap();

        let mut worker = fixture.worker();
        worker.setup(SetupOptions::worker(1)).await.unwrap();
        let snapshot = primary.session().unwrap().config_snapshot_path;

        primary.emergency_teardown(Some("SIGTERM"));
        assert!(!snapshot.exists());

        // Both raw logs were moved next to the artifacts instead of merged
        let moved = raw_logs_in(&fixture.artifacts_dir());
        assert_eq!(moved.len(), 2);
        assert!(!fixture.artifacts_dir().join("e2e.log.jsonl").exists());

        assert!(primary.ipc_server().is_none());
        let _ = worker.teardown().await;
    }

    // ============ Offline Merge ============

    #[tokio::test]
    async fn test_merge_logs_orders_by_time_with_primary_first_on_ties() {
        let dir = TempDir::new().unwrap();
        let at = |secs: i64| chrono::DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap();
        let record = |secs: i64, msg: &str| LogRecord {
            time: at(secs),
            level: LogLevel::Info,
            meta: serde_json::Map::new(),
            args: vec![serde_json::json!(msg)],
        };

        let write = |name: &str, records: &[LogRecord]| {
            let path = dir.path().join(name);
            let lines: Vec<String> = records
                .iter()
                .map(|r| serde_json::to_string(r).unwrap())
                .collect();
            std::fs::write(&path, lines.join("\n") + "\n").unwrap();
            path
        };

        let primary = write(
            "e2e-conductor.1.a.log.jsonl",
            &[record(0, "primary start"), record(2, "primary tie")],
        );
        let worker = write(
            "e2e-conductor.2.b.log.jsonl",
            &[record(1, "worker start"), record(2, "worker tie")],
        );

        let out = dir.path().join("out");
        let summary = merge_logs(
            vec![primary.clone(), worker.clone()],
            out.clone(),
            DebugFormatOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(summary.records, 4);

        let messages: Vec<String> = read_records(&out.join("e2e.log.jsonl"))
            .iter()
            .map(LogRecord::message)
            .collect();
        assert_eq!(
            messages,
            vec!["primary start", "worker start", "primary tie", "worker tie"]
        );
        assert!(!primary.exists());
        assert!(!worker.exists());
    }
}
