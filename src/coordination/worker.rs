use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, json};
use tracing::info;

use super::context::{ContextInternals, RunContext, SetupOptions, WorkerRuntime};
use crate::config::{IPC_CONFIG_TIMEOUT, SNAPSHOT_PATH_ENV, WORKER_INDEX_ENV};
use crate::devices::{AllocationDriver, DeviceCookie};
use crate::error::{OrchestratorError, Result};
use crate::ipc::IpcClient;
use crate::logs::{LogRecord, Logger};
use crate::session::SessionState;

/// Context of one worker process
///
/// Rehydrates the session from the snapshot the primary published, joins the
/// IPC bus and leases a device for the duration of the worker.
pub struct WorkerContext {
    snapshot_env_var: String,
    config_timeout: Duration,
    base_logger: Logger,
    logger: Logger,
    session: Option<SessionState>,
    ipc: Option<IpcClient>,
    runtime: WorkerRuntime,
}

impl WorkerContext {
    /// Worker writing its raw log into `log_dir`
    pub fn new(
        log_dir: &Path,
        registry_dir: impl Into<PathBuf>,
        driver: Arc<dyn AllocationDriver>,
    ) -> Result<Self> {
        let logger = Logger::create_in(log_dir)
            .map_err(|e| OrchestratorError::Io(std::io::Error::other(format!("{e:#}"))))?;

        Ok(Self {
            snapshot_env_var: SNAPSHOT_PATH_ENV.to_string(),
            config_timeout: IPC_CONFIG_TIMEOUT,
            base_logger: logger.clone(),
            logger,
            session: None,
            ipc: None,
            runtime: WorkerRuntime::new(registry_dir, driver),
        })
    }

    /// Read the snapshot path from `name` instead of the default variable
    pub fn with_snapshot_env_var(mut self, name: impl Into<String>) -> Self {
        self.snapshot_env_var = name.into();
        self
    }

    pub fn with_config_timeout(mut self, timeout: Duration) -> Self {
        self.config_timeout = timeout;
        self
    }

    pub fn device(&self) -> Option<&DeviceCookie> {
        self.runtime.device()
    }

    /// Latest workers count broadcast by the primary
    pub fn workers_count(&self) -> usize {
        self.ipc.as_ref().map(IpcClient::workers_count).unwrap_or(0)
    }

    /// Ship the record to the primary's run log
    ///
    /// Before setup, or after teardown, the record goes to this worker's own
    /// log instead. Either way it lands in exactly one merge source.
    pub async fn log_to_primary(&self, record: &LogRecord) -> Result<()> {
        match &self.ipc {
            Some(ipc) => ipc.log(record).await,
            None => {
                self.logger.write_record(record);
                Ok(())
            }
        }
    }

    pub async fn report_failed_tests(&self, test_file_paths: Vec<String>, permanent: bool) -> Result<()> {
        match &self.ipc {
            Some(ipc) => ipc.report_failed_tests(test_file_paths, permanent).await,
            None => Err(OrchestratorError::Configuration(
                "Worker context is not set up".to_string(),
            )),
        }
    }

    fn resolve_worker_index(options: SetupOptions) -> Result<usize> {
        if let Some(index) = options.worker_index {
            return Ok(index);
        }

        match std::env::var(WORKER_INDEX_ENV) {
            Ok(raw) => raw.parse().map_err(|_| {
                OrchestratorError::Configuration(format!("Invalid {WORKER_INDEX_ENV} value '{raw}'"))
            }),
            Err(_) => Ok(1),
        }
    }
}

#[async_trait]
impl RunContext for WorkerContext {
    async fn setup(&mut self, options: SetupOptions) -> Result<()> {
        let worker_index = Self::resolve_worker_index(options)?;
        if worker_index == 0 {
            return Err(OrchestratorError::Configuration(
                "Worker indices start at 1".to_string(),
            ));
        }

        let mut session = match self.session.take() {
            Some(session) => session,
            None => SessionState::from_env(&self.snapshot_env_var).await?,
        };
        session.worker_index = worker_index;

        let mut meta = Map::new();
        meta.insert("tid".to_string(), json!(worker_index));
        self.logger = self.base_logger.child(meta);
        if let Some(config) = &session.config {
            self.logger.set_config(config.logger.clone());
        }

        let ipc = IpcClient::connect(&session.ipc_server_id).await?;
        ipc.register_worker(worker_index, self.logger.file().map(Path::to_path_buf))
            .await?;
        let broadcast = ipc.wait_for_config(self.config_timeout).await?;
        if broadcast.config.is_some() {
            session.config = broadcast.config;
        }
        self.ipc = Some(ipc);
        self.restore_session_state(session);

        let Some(config) = self.session.as_ref().and_then(|s| s.config.clone()) else {
            return Err(OrchestratorError::Configuration(
                "Session snapshot does not contain a resolved configuration".to_string(),
            ));
        };
        let logger = self.logger.clone();
        self.worker_runtime_mut().setup(&config, &logger).await?;

        info!(worker_index, "Worker context ready");
        self.logger.info(format!("Worker {worker_index} ready"));
        Ok(())
    }

    async fn teardown(&mut self) -> Result<()> {
        let logger = self.logger.clone();
        let freed = self.worker_runtime_mut().teardown(&logger).await;

        self.logger.close();
        if let Some(ipc) = self.ipc.take() {
            ipc.disconnect().await;
        }
        freed
    }

    fn session(&self) -> Option<SessionState> {
        self.session.clone()
    }

    fn logger(&self) -> &Logger {
        &self.logger
    }
}

impl ContextInternals for WorkerContext {
    fn restore_session_state(&mut self, state: SessionState) {
        self.session = Some(state);
    }

    fn worker_runtime_mut(&mut self) -> &mut WorkerRuntime {
        &mut self.runtime
    }
}
