use clap::{Parser, Subcommand};
use e2e_conductor::logs::DebugFormatOptions;
use e2e_conductor::runner::{
    SessionArgs, WorkerArgs, merge_logs, reset_locks, run_session, run_worker,
};
use e2e_conductor::telemetry::init_tracing;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Clone)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Subcommand)]
enum Command {
    /// Run a session: global setup, N worker processes, global teardown
    Run {
        /// JSON run configuration (defaults apply when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of worker processes
        #[arg(short, long, default_value = "1")]
        workers: usize,

        /// Directory of the device lock files (default: system temp directory)
        #[arg(long)]
        registry_dir: Option<PathBuf>,

        /// Directory for per-process raw logs (default: system temp directory)
        #[arg(long)]
        log_dir: Option<PathBuf>,

        /// How long each worker holds its device, in milliseconds
        #[arg(long, default_value = "0")]
        hold_ms: u64,

        /// Quiet mode - minimal output, only show summary
        #[arg(short, long)]
        quiet: bool,
    },

    /// Join the session published in the environment (spawned by `run`)
    Worker {
        #[arg(long)]
        registry_dir: Option<PathBuf>,

        #[arg(long)]
        log_dir: Option<PathBuf>,

        /// Test file to report as failed (repeatable)
        #[arg(long = "failed-test")]
        failed_tests: Vec<String>,

        /// Mark reported failures as permanent (no retry)
        #[arg(long)]
        permanent: bool,

        #[arg(long, default_value = "0")]
        hold_ms: u64,

        #[arg(short, long)]
        quiet: bool,
    },

    /// Merge raw per-process logs into the e2e.* artifacts
    MergeLogs {
        /// Raw logs, primary first; when omitted every raw log in --from is used
        sources: Vec<PathBuf>,

        /// Directory searched for leftover raw logs
        #[arg(long)]
        from: Option<PathBuf>,

        /// Output directory of the merged artifacts
        #[arg(short, long, default_value = ".")]
        out_dir: PathBuf,

        /// Render metadata in the human-readable log
        #[arg(long)]
        show_metadata: bool,
    },

    /// Clear stale device lock files
    ResetLocks {
        /// Device type (e.g. ios.simulator, android.emulator, stub)
        #[arg(short = 't', long, default_value = "stub")]
        device_type: String,

        #[arg(long)]
        registry_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Run {
            config,
            workers,
            registry_dir,
            log_dir,
            hold_ms,
            quiet,
        } => {
            init_tracing(quiet);
            run(config, workers, registry_dir, log_dir, hold_ms, quiet).await?;
        }
        Command::Worker {
            registry_dir,
            log_dir,
            failed_tests,
            permanent,
            hold_ms,
            quiet,
        } => {
            init_tracing(quiet);
            let result = run_worker(WorkerArgs {
                registry_dir,
                log_dir,
                failed_tests,
                permanent_failure: permanent,
                hold: Duration::from_millis(hold_ms),
            })
            .await?;
            if !quiet {
                println!(
                    "Worker {} finished on {} ({} workers)",
                    result.worker_index,
                    result.device.as_deref().unwrap_or("no device"),
                    result.workers_count
                );
            }
        }
        Command::MergeLogs {
            sources,
            from,
            out_dir,
            show_metadata,
        } => {
            init_tracing(false);
            let sources = if sources.is_empty() {
                let dir = from.unwrap_or_else(std::env::temp_dir);
                cli::collect_raw_logs(&dir)?
            } else {
                sources
            };
            if sources.is_empty() {
                println!("No raw logs to merge");
                return Ok(());
            }

            let options = DebugFormatOptions {
                show_metadata,
                ..DebugFormatOptions::default()
            };
            let summary = merge_logs(sources, out_dir.clone(), options).await?;
            println!(
                "Merged {} records from {} files into {}",
                summary.records,
                summary.sources.len(),
                out_dir.display()
            );
        }
        Command::ResetLocks {
            device_type,
            registry_dir,
        } => {
            init_tracing(false);
            let device_type = cli::parse_device_type(&device_type)?;
            reset_locks(registry_dir, device_type).await?;
        }
    }
    Ok(())
}

async fn run(
    config: Option<PathBuf>,
    workers: usize,
    registry_dir: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    hold_ms: u64,
    quiet: bool,
) -> anyhow::Result<()> {
    if workers == 0 {
        anyhow::bail!("At least one worker is required");
    }

    if !quiet {
        println!("E2E Conductor");
        println!("=============");
        if let Some(path) = &config {
            println!("Config: {}", path.display());
        }
        println!("Workers: {}", workers);
        println!();
    }

    let mut worker_args = vec!["worker".to_string(), "--hold-ms".to_string(), hold_ms.to_string()];
    if quiet {
        worker_args.push("--quiet".to_string());
    }
    if let Some(dir) = &registry_dir {
        worker_args.push("--registry-dir".to_string());
        worker_args.push(dir.display().to_string());
    }
    if let Some(dir) = &log_dir {
        worker_args.push("--log-dir".to_string());
        worker_args.push(dir.display().to_string());
    }

    let result = run_session(SessionArgs {
        config_path: config,
        worker_count: workers,
        worker_program: std::env::current_exe()?,
        worker_args,
        registry_dir,
        log_dir,
    })
    .await?;

    println!();
    println!("Session Summary");
    println!("===============");
    println!("Session ID: {}", result.session_id);
    println!("Workers succeeded: {}", result.workers_succeeded);
    println!("Workers failed: {}", result.workers_failed);
    println!("Duration: {:.2}s", result.duration.as_secs_f64());

    if !result.failed_tests.is_empty() {
        println!();
        println!(
            "Failed tests{}:",
            if result.failed_tests.permanent { " (permanent)" } else { "" }
        );
        for path in &result.failed_tests.test_file_paths {
            println!("  {}", path);
        }
    }

    if let Some(summary) = &result.merged {
        println!();
        println!(
            "Merged {} log records from {} processes",
            summary.records,
            summary.sources.len()
        );
    }
    if let Some(error) = &result.merge_error {
        println!();
        println!("Log merge failed, raw logs were kept: {}", error);
    }

    if result.workers_failed > 0 {
        anyhow::bail!("{} worker(s) failed", result.workers_failed);
    }
    Ok(())
}

/// CLI utility functions for parsing command-line arguments
mod cli {
    use e2e_conductor::config::TEMP_FILE_PREFIX;
    use e2e_conductor::devices::DeviceType;
    use std::path::{Path, PathBuf};

    /// Parse a device type name like "ios.simulator" or "android.emulator"
    pub fn parse_device_type(name: &str) -> anyhow::Result<DeviceType> {
        serde_json::from_value(serde_json::Value::String(name.trim().to_string())).map_err(|_| {
            anyhow::anyhow!(
                "Unknown device type '{}'. Valid types: ios.none, ios.simulator, \
                 android.attached, android.emulator, android.genycloud, stub",
                name
            )
        })
    }

    /// Whether `path` names a raw per-process log file
    pub fn is_raw_log(path: &Path) -> bool {
        path.file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| {
                name.starts_with(&format!("{TEMP_FILE_PREFIX}.")) && name.ends_with(".log.jsonl")
            })
    }

    /// Raw logs found in `dir`, oldest first
    pub fn collect_raw_logs(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if is_raw_log(&path) {
                let modified = entry.metadata()?.modified()?;
                found.push((modified, path));
            }
        }
        found.sort();
        Ok(found.into_iter().map(|(_, path)| path).collect())
    }

}
