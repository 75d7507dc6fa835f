use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use derive_builder::Builder;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::collaborators::{
    AuxiliaryServer, AuxiliaryServerFactory, ConfigResolver, GlobalLifecycleHandler,
    LoopbackServerFactory, NoopLifecycleHandler, requested_port,
};
use super::context::{ContextInternals, RunContext, SetupOptions, WorkerRuntime};
use crate::config::{MERGED_LOG_NAME, SNAPSHOT_PATH_ENV};
use crate::devices::{AllocationDriver, StaticPoolDriver, default_registry_dir, reset_lock_files};
use crate::error::{OrchestratorError, Result};
use crate::ipc::{FailedTests, IpcServer};
use crate::logs::{LogMergePipeline, Logger, MergeSummary, Tracer, relocate_logs_sync};
use crate::session::{RunConfig, SessionState};

const LIFECYCLE: &str = "lifecycle";

/// Collaborators and locations handed to a [`PrimaryContext`]
#[derive(Builder)]
pub struct ContextDependencies {
    config_resolver: Arc<dyn ConfigResolver>,
    #[builder(default = "Arc::new(NoopLifecycleHandler)")]
    lifecycle_handler: Arc<dyn GlobalLifecycleHandler>,
    #[builder(default = "Arc::new(LoopbackServerFactory)")]
    server_factory: Arc<dyn AuxiliaryServerFactory>,
    #[builder(default = "Arc::new(StaticPoolDriver)")]
    allocation_driver: Arc<dyn AllocationDriver>,
    /// Directory of the device lock files
    #[builder(setter(into), default = "default_registry_dir()")]
    registry_dir: PathBuf,
    /// Directory receiving the primary's raw log file
    #[builder(setter(into), default = "std::env::temp_dir()")]
    log_dir: PathBuf,
    /// Environment variable publishing the snapshot path to workers
    #[builder(setter(into), default = "SNAPSHOT_PATH_ENV.to_string()")]
    snapshot_env_var: String,
    /// IPC endpoint name; `primary-<pid>` when unset
    #[builder(setter(into, strip_option), default)]
    ipc_server_id: Option<String>,
    /// Name of the lifecycle span
    #[builder(setter(into), default = "std::env::args().collect::<Vec<_>>().join(\" \")")]
    command_line: String,
    #[builder(default = "true")]
    install_signal_hook: bool,
}

/// What a completed global teardown left behind
#[derive(Debug, Clone, Default)]
pub struct TeardownReport {
    /// Present when the logs were merged
    pub merge: Option<MergeSummary>,
    /// Set when the merge failed; the raw logs were kept
    pub merge_error: Option<String>,
    pub failed_tests: FailedTests,
}

/// Resources reachable from both the async teardown and the signal hook
struct PrimaryShared {
    initialized: AtomicBool,
    torn_down: AtomicBool,
    logger: Logger,
    tracer: Tracer,
    lifecycle_handler: Arc<dyn GlobalLifecycleHandler>,
    snapshot_env_var: String,
    ipc: Mutex<Option<Arc<IpcServer>>>,
    aux_server: Mutex<Option<Arc<dyn AuxiliaryServer>>>,
    session: RwLock<Option<SessionState>>,
}

/// Context of the primary process
///
/// Owns the IPC bus, the session snapshot and the merged artifacts. Global
/// teardown must be called even when global setup failed part-way; it cleans
/// up whatever was started.
pub struct PrimaryContext {
    config_resolver: Arc<dyn ConfigResolver>,
    server_factory: Arc<dyn AuxiliaryServerFactory>,
    registry_dir: PathBuf,
    ipc_server_id: String,
    command_line: String,
    install_signal_hook: bool,
    shared: Arc<PrimaryShared>,
    runtime: WorkerRuntime,
    signal_task: Option<JoinHandle<()>>,
}

impl PrimaryContext {
    pub fn new(deps: ContextDependencies) -> Result<Self> {
        let ContextDependencies {
            config_resolver,
            lifecycle_handler,
            server_factory,
            allocation_driver,
            registry_dir,
            log_dir,
            snapshot_env_var,
            ipc_server_id,
            command_line,
            install_signal_hook,
        } = deps;

        let logger = Logger::create_in(&log_dir)
            .map_err(|e| OrchestratorError::Io(std::io::Error::other(format!("{e:#}"))))?;
        let tracer = Tracer::new(logger.clone());

        Ok(Self {
            config_resolver,
            server_factory,
            runtime: WorkerRuntime::new(registry_dir.clone(), allocation_driver),
            registry_dir,
            ipc_server_id: ipc_server_id
                .unwrap_or_else(|| format!("primary-{}", std::process::id())),
            command_line,
            install_signal_hook,
            shared: Arc::new(PrimaryShared {
                initialized: AtomicBool::new(false),
                torn_down: AtomicBool::new(false),
                logger,
                tracer,
                lifecycle_handler,
                snapshot_env_var,
                ipc: Mutex::new(None),
                aux_server: Mutex::new(None),
                session: RwLock::new(None),
            }),
            signal_task: None,
        })
    }

    /// Bring up everything the workers depend on
    ///
    /// Fails with `DuplicateInitialization` when called twice on one context.
    pub async fn global_setup(&mut self) -> Result<()> {
        if self.shared.initialized.swap(true, Ordering::SeqCst) {
            return Err(OrchestratorError::DuplicateInitialization);
        }

        if self.install_signal_hook {
            self.signal_task = spawn_signal_hook(Arc::clone(&self.shared));
        }

        let mut config = self
            .config_resolver
            .resolve()
            .await
            .map_err(|e| OrchestratorError::Configuration(format!("{e:#}")))?;

        let logger = &self.shared.logger;
        logger.set_config(config.logger.clone());
        self.shared
            .tracer
            .begin(LIFECYCLE, &self.command_line, json!(null));

        let mut session = SessionState::create(self.ipc_server_id.clone());
        if let Some(file) = logger.file() {
            session.add_log_file(file);
        }
        session.config = Some(config.clone());

        let ipc = Arc::new(IpcServer::new(session.clone(), logger.clone()));
        *self.shared.ipc.lock() = Some(Arc::clone(&ipc));
        ipc.start().await?;

        self.shared
            .lifecycle_handler
            .global_init(&config)
            .await
            .map_err(OrchestratorError::Environment)?;

        if !config.behavior.init.keep_lock_file {
            reset_lock_files(&self.registry_dir, config.device.device_type).await?;
        }

        if config.session.auto_start {
            let port = requested_port(config.session.server.as_deref())
                .map_err(|e| OrchestratorError::Configuration(format!("{e:#}")))?;
            let server = self.server_factory.create(port);
            *self.shared.aux_server.lock() = Some(Arc::clone(&server));

            let bound = server
                .open()
                .await
                .map_err(OrchestratorError::AuxiliaryServer)?;
            if config.session.server.is_none() {
                config.session.server = Some(format!("ws://localhost:{bound}"));
            }
        }

        session.config = Some(config);
        ipc.update_session(|shared| shared.config = session.config.clone());
        session.write_snapshot().await?;

        // SAFETY: the variable is written only here and in global_teardown.
        // In-process workers read it strictly between those two calls, and
        // nothing else in this crate mutates the environment.
        unsafe {
            std::env::set_var(&self.shared.snapshot_env_var, &session.config_snapshot_path);
        }

        info!(
            session_id = %session.session_id,
            snapshot = %session.config_snapshot_path.display(),
            "Primary context initialized"
        );
        *self.shared.session.write() = Some(session);
        Ok(())
    }

    /// Orderly shutdown of everything global setup started
    ///
    /// Every cleanup step runs even when an earlier one failed; the first
    /// failure is returned and the lifecycle span and log merge are skipped.
    /// The log merge runs last and its failure is only reported in the
    /// returned [`TeardownReport`].
    pub async fn global_teardown(&mut self) -> Result<TeardownReport> {
        if let Some(task) = self.signal_task.take() {
            task.abort();
        }
        if self.shared.torn_down.swap(true, Ordering::SeqCst) {
            return Ok(TeardownReport::default());
        }

        let shared = &self.shared;
        let mut first_error: Option<OrchestratorError> = None;

        if shared.initialized.load(Ordering::SeqCst)
            && let Err(e) = shared.lifecycle_handler.global_cleanup().await
        {
            warn!("Global cleanup failed: {:#}", e);
            first_error.get_or_insert(OrchestratorError::Environment(e));
        }

        if let Some(server) = shared.aux_server.lock().take() {
            server.close();
        }

        let mut report = TeardownReport::default();
        let ipc = shared.ipc.lock().take();
        if let Some(ipc) = ipc {
            report.failed_tests = ipc.failed_tests();
            if let Some(session) = shared.session.write().as_mut() {
                session.worker_log_files = ipc.session().worker_log_files;
            }
            ipc.dispose();
        }

        let session = shared.session.read().clone();
        if let Some(session) = &session {
            if let Err(e) = session.remove_snapshot().await {
                warn!("Failed to remove session snapshot: {}", e);
                first_error.get_or_insert(e);
            }
            // SAFETY: workers reading the variable have finished setup by
            // now; see global_setup.
            unsafe {
                std::env::remove_var(&shared.snapshot_env_var);
            }
        }

        if let Some(e) = first_error {
            // Raw logs stay where they are for a later merge-logs run
            shared.logger.close();
            return Err(e);
        }

        shared.tracer.end(LIFECYCLE, json!(null));
        shared.logger.close();

        if let Some(session) = &session
            && let Some(config) = &session.config
            && config.logs_enabled()
        {
            match finalize_logs(config, &session.merge_sources()).await {
                Ok(summary) => report.merge = Some(summary),
                Err(e) => {
                    error!("Failed to finalize logs: {}", e);
                    report.merge_error = Some(e.to_string());
                }
            }
        }

        Ok(report)
    }

    /// Synchronous best-effort teardown after a termination signal
    ///
    /// Does nothing without a signal, or when a teardown already ran.
    pub fn emergency_teardown(&self, signal: Option<&str>) {
        self.shared.emergency_teardown(signal);
    }

    /// Record failed test files reported by an in-process worker
    pub fn report_failed_tests(&self, test_file_paths: Vec<String>, permanent: bool) {
        if let Some(ipc) = self.shared.ipc.lock().as_ref() {
            ipc.on_failed_tests(test_file_paths, permanent);
        }
    }

    pub fn failed_tests(&self) -> FailedTests {
        self.shared
            .ipc
            .lock()
            .as_ref()
            .map(|ipc| ipc.failed_tests())
            .unwrap_or_default()
    }

    /// The running IPC server, between global setup and teardown
    pub fn ipc_server(&self) -> Option<Arc<IpcServer>> {
        self.shared.ipc.lock().clone()
    }

    /// Resolved config of the current run
    pub fn run_config(&self) -> Option<RunConfig> {
        self.shared
            .session
            .read()
            .as_ref()
            .and_then(|session| session.config.clone())
    }

    pub fn device(&self) -> Option<&crate::devices::DeviceCookie> {
        self.runtime.device()
    }
}

#[async_trait]
impl RunContext for PrimaryContext {
    /// Run an in-process worker: register it, then lease its device
    async fn setup(&mut self, options: SetupOptions) -> Result<()> {
        let worker_index = options.worker_index.unwrap_or(1);
        if worker_index == 0 {
            return Err(OrchestratorError::Configuration(
                "Worker indices start at 1".to_string(),
            ));
        }
        let config = self.run_config().ok_or_else(|| {
            OrchestratorError::Configuration("Primary context is not initialized".to_string())
        })?;

        if let Some(ipc) = self.ipc_server() {
            ipc.on_register_worker(worker_index, None);
        }

        let logger = self.shared.logger.clone();
        self.worker_runtime_mut().setup(&config, &logger).await
    }

    async fn teardown(&mut self) -> Result<()> {
        let logger = self.shared.logger.clone();
        self.worker_runtime_mut().teardown(&logger).await
    }

    fn session(&self) -> Option<SessionState> {
        self.shared.session.read().clone()
    }

    fn logger(&self) -> &Logger {
        &self.shared.logger
    }
}

impl ContextInternals for PrimaryContext {
    fn restore_session_state(&mut self, state: SessionState) {
        *self.shared.session.write() = Some(state);
    }

    fn worker_runtime_mut(&mut self) -> &mut WorkerRuntime {
        &mut self.runtime
    }
}

impl Drop for PrimaryContext {
    fn drop(&mut self) {
        if let Some(task) = self.signal_task.take() {
            task.abort();
        }
    }
}

impl PrimaryShared {
    fn emergency_teardown(&self, signal: Option<&str>) {
        let Some(signal) = signal else {
            return;
        };
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }

        warn!(signal, "Emergency teardown");
        self.lifecycle_handler.emergency_cleanup();

        if let Some(server) = self.aux_server.lock().take() {
            server.close();
        }
        let mut session = self.session.read().clone();
        if let Some(ipc) = self.ipc.lock().take() {
            if let Some(session) = session.as_mut() {
                session.worker_log_files = ipc.session().worker_log_files;
            }
            ipc.dispose();
        }

        let mut log_files = Vec::new();
        if let Some(session) = &session {
            if let Err(e) = std::fs::remove_file(&session.config_snapshot_path)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!("Failed to remove session snapshot: {}", e);
            }
            log_files = session.merge_sources();
        }

        self.tracer.end(LIFECYCLE, json!({ "abortSignal": signal }));
        self.logger.close();

        if let Some(config) = session.as_ref().and_then(|s| s.config.as_ref())
            && config.logs_enabled()
            && let Some(root_dir) = &config.artifacts.root_dir
        {
            match relocate_logs_sync(root_dir, &log_files) {
                Ok(moved) => info!("Moved {} raw logs into {}", moved.len(), root_dir.display()),
                Err(e) => error!("Failed to move raw logs: {}", e),
            }
        }
    }
}

async fn finalize_logs(config: &RunConfig, log_files: &[PathBuf]) -> Result<MergeSummary> {
    let Some(root_dir) = &config.artifacts.root_dir else {
        return Ok(MergeSummary {
            skipped: true,
            ..MergeSummary::default()
        });
    };

    LogMergePipeline::new(log_files.to_vec())
        .with_standard_sinks(root_dir, MERGED_LOG_NAME, config.logger.options.clone())
        .await?
        .run()
        .await
}

#[cfg(unix)]
fn spawn_signal_hook(shared: Arc<PrimaryShared>) -> Option<JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let hooks = (|| {
        Some((
            signal(SignalKind::interrupt()).ok()?,
            signal(SignalKind::terminate()).ok()?,
            signal(SignalKind::hangup()).ok()?,
        ))
    })();
    let Some((mut sigint, mut sigterm, mut sighup)) = hooks else {
        warn!("Could not install termination signal hooks");
        return None;
    };

    Some(tokio::spawn(async move {
        let (name, number) = tokio::select! {
            _ = sigint.recv() => ("SIGINT", libc::SIGINT),
            _ = sigterm.recv() => ("SIGTERM", libc::SIGTERM),
            _ = sighup.recv() => ("SIGHUP", libc::SIGHUP),
        };

        shared.emergency_teardown(Some(name));
        std::process::exit(128 + number);
    }))
}

#[cfg(not(unix))]
fn spawn_signal_hook(shared: Arc<PrimaryShared>) -> Option<JoinHandle<()>> {
    Some(tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shared.emergency_teardown(Some("SIGINT"));
            std::process::exit(130);
        }
    }))
}
