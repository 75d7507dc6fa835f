//! High-level runner API for distributed test sessions.
//!
//! This module wires the primary and worker contexts to real processes and is
//! the API the CLI is built on.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::{MERGED_LOG_NAME, SNAPSHOT_PATH_ENV, WORKER_INDEX_ENV};
use crate::coordination::{
    ConfigResolver, ContextDependenciesBuilder, JsonFileConfigResolver, PrimaryContext,
    RunContext, SetupOptions, StaticConfigResolver, WorkerContext,
};
use crate::devices::{DeviceType, StaticPoolDriver, default_registry_dir, reset_lock_files};
use crate::ipc::FailedTests;
use crate::logs::{DebugFormatOptions, LogLevel, LogMergePipeline, LogRecord, MergeSummary};

/// Arguments for running a whole session: one primary and N worker processes
#[derive(Debug, Clone)]
pub struct SessionArgs {
    /// JSON run configuration; defaults apply when absent
    pub config_path: Option<PathBuf>,
    pub worker_count: usize,
    /// Program started once per worker (with `worker_args`)
    pub worker_program: PathBuf,
    pub worker_args: Vec<String>,
    pub registry_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
}

/// Result of a completed session
#[derive(Debug)]
pub struct SessionResult {
    pub session_id: String,
    pub workers_succeeded: usize,
    pub workers_failed: usize,
    pub duration: Duration,
    pub failed_tests: FailedTests,
    /// Merged artifacts, when logs were enabled and the merge succeeded
    pub merged: Option<MergeSummary>,
    pub merge_error: Option<String>,
}

/// Run a session with the specified arguments
///
/// Global teardown always runs once global setup was attempted, so a failed
/// setup still releases the IPC endpoint and the snapshot.
pub async fn run_session(args: SessionArgs) -> Result<SessionResult> {
    let start_time = Instant::now();

    let resolver: Arc<dyn ConfigResolver> = match &args.config_path {
        Some(path) => Arc::new(JsonFileConfigResolver::new(path)),
        None => Arc::new(StaticConfigResolver::default()),
    };

    let mut builder = ContextDependenciesBuilder::default();
    builder.config_resolver(resolver);
    if let Some(dir) = &args.registry_dir {
        builder.registry_dir(dir);
    }
    if let Some(dir) = &args.log_dir {
        builder.log_dir(dir);
    }
    let deps = builder.build()?;

    let mut context = PrimaryContext::new(deps)?;
    if let Err(e) = context.global_setup().await {
        if let Err(teardown) = context.global_teardown().await {
            warn!("Teardown after failed setup also failed: {}", teardown);
        }
        return Err(e).context("Global setup failed");
    }

    let session = context
        .session()
        .context("Primary context has no session after setup")?;
    info!(
        "Session {} started, spawning {} workers",
        session.session_id, args.worker_count
    );

    let mut children = Vec::with_capacity(args.worker_count);
    for worker_index in 1..=args.worker_count {
        let spawned = Command::new(&args.worker_program)
            .args(&args.worker_args)
            .env(WORKER_INDEX_ENV, worker_index.to_string())
            .env(SNAPSHOT_PATH_ENV, &session.config_snapshot_path)
            .kill_on_drop(true)
            .spawn();

        match spawned {
            Ok(child) => children.push((worker_index, child)),
            Err(e) => warn!("Failed to spawn worker {}: {}", worker_index, e),
        }
    }
    let spawn_failures = args.worker_count - children.len();

    let statuses = futures::future::join_all(
        children
            .into_iter()
            .map(|(worker_index, mut child)| async move { (worker_index, child.wait().await) }),
    )
    .await;

    let mut workers_succeeded = 0;
    let mut workers_failed = spawn_failures;
    for (worker_index, status) in statuses {
        match status {
            Ok(status) if status.success() => workers_succeeded += 1,
            Ok(status) => {
                warn!("Worker {} exited with {}", worker_index, status);
                workers_failed += 1;
            }
            Err(e) => {
                warn!("Failed to wait for worker {}: {}", worker_index, e);
                workers_failed += 1;
            }
        }
    }

    let report = context.global_teardown().await?;

    Ok(SessionResult {
        session_id: session.session_id,
        workers_succeeded,
        workers_failed,
        duration: start_time.elapsed(),
        failed_tests: report.failed_tests,
        merged: report.merge,
        merge_error: report.merge_error,
    })
}

/// Arguments of one worker process
#[derive(Debug, Clone, Default)]
pub struct WorkerArgs {
    pub registry_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    /// Test files to report as failed before exiting
    pub failed_tests: Vec<String>,
    pub permanent_failure: bool,
    /// Time to hold the device before tearing down
    pub hold: Duration,
}

#[derive(Debug)]
pub struct WorkerResult {
    pub worker_index: usize,
    pub device: Option<String>,
    pub workers_count: usize,
}

/// Join the session published in the environment, hold a device, then leave
pub async fn run_worker(args: WorkerArgs) -> Result<WorkerResult> {
    let log_dir = args.log_dir.unwrap_or_else(std::env::temp_dir);
    let registry_dir = args.registry_dir.unwrap_or_else(default_registry_dir);

    let mut context = WorkerContext::new(&log_dir, registry_dir, Arc::new(StaticPoolDriver))?;
    context.setup(SetupOptions::default()).await?;

    let worker_index = context
        .session()
        .map(|session| session.worker_index)
        .unwrap_or(1);
    let device = context.device().map(|cookie| cookie.id.clone());

    let message = match &device {
        Some(id) => format!("Worker {worker_index} running on {id}"),
        None => format!("Worker {worker_index} running without a device"),
    };
    context
        .log_to_primary(&LogRecord::new(
            LogLevel::Info,
            serde_json::Map::new(),
            vec![serde_json::json!(message)],
        ))
        .await?;

    if !args.failed_tests.is_empty() {
        context
            .report_failed_tests(args.failed_tests, args.permanent_failure)
            .await?;
    }

    tokio::time::sleep(args.hold).await;
    let workers_count = context.workers_count();
    context.teardown().await?;

    Ok(WorkerResult {
        worker_index,
        device,
        workers_count,
    })
}

/// Merge leftover per-process logs into `<root_dir>/e2e.*` artifacts
pub async fn merge_logs(
    sources: Vec<PathBuf>,
    root_dir: PathBuf,
    options: DebugFormatOptions,
) -> Result<MergeSummary> {
    let summary = LogMergePipeline::new(sources)
        .with_standard_sinks(&root_dir, MERGED_LOG_NAME, options)
        .await?
        .run()
        .await?;
    Ok(summary)
}

/// Clear the device lock files used by `device_type`
pub async fn reset_locks(registry_dir: Option<PathBuf>, device_type: DeviceType) -> Result<()> {
    let registry_dir = registry_dir.unwrap_or_else(default_registry_dir);
    reset_lock_files(&registry_dir, device_type)
        .await
        .with_context(|| format!("Failed to reset lock files in {}", registry_dir.display()))
}
