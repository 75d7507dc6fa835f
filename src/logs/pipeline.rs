use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, anyhow};
use futures::TryStreamExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::logger::DebugFormatOptions;
use super::merge::merge_sorted;
use super::reader::read_jsonl;
use super::record::LogRecord;
use super::sinks::{ChromeTraceWriter, DebugWriter, JsonlWriter, RecordWriter};
use crate::config::SINK_CHANNEL_CAPACITY;
use crate::error::{OrchestratorError, Result};

/// Outcome of a completed merge
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeSummary {
    pub sources: Vec<PathBuf>,
    pub records: u64,
    pub skipped: bool,
}

/// Merges per-process JSON-lines logs into several outputs at once
///
/// Sources are listed in precedence order (primary first, then workers by
/// index). The merged sequence is produced once and fanned out to every sink
/// over bounded channels. Source files are deleted only after every sink
/// finished; any failure keeps them for manual recovery.
pub struct LogMergePipeline {
    sources: Vec<PathBuf>,
    sinks: Vec<Box<dyn RecordWriter>>,
}

impl LogMergePipeline {
    pub fn new(sources: Vec<PathBuf>) -> Self {
        Self {
            sources,
            sinks: Vec::new(),
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn RecordWriter>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Add the `<name>.log.jsonl`, `<name>.log` and `<name>.trace.json` sinks under `root_dir`
    pub async fn with_standard_sinks(
        self,
        root_dir: &Path,
        name: &str,
        options: DebugFormatOptions,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(root_dir).await?;

        let jsonl = JsonlWriter::create(root_dir.join(format!("{name}.log.jsonl")))
            .await
            .map_err(merge_failure)?;
        let debug = DebugWriter::create(root_dir.join(format!("{name}.log")), options)
            .await
            .map_err(merge_failure)?;
        let trace = ChromeTraceWriter::create(root_dir.join(format!("{name}.trace.json")))
            .await
            .map_err(merge_failure)?;

        Ok(self
            .with_sink(Box::new(jsonl))
            .with_sink(Box::new(debug))
            .with_sink(Box::new(trace)))
    }

    pub async fn run(self) -> Result<MergeSummary> {
        let sources: Vec<PathBuf> = self
            .sources
            .into_iter()
            .filter(|path| path.exists())
            .collect();

        if sources.is_empty() {
            info!("No process logs to merge");
            return Ok(MergeSummary {
                skipped: true,
                ..MergeSummary::default()
            });
        }

        info!(
            "Merging {} process logs into {} outputs",
            sources.len(),
            self.sinks.len()
        );

        let mut senders = Vec::with_capacity(self.sinks.len());
        let mut handles = Vec::with_capacity(self.sinks.len());
        for sink in self.sinks {
            let (tx, rx) = mpsc::channel::<Arc<LogRecord>>(SINK_CHANNEL_CAPACITY);
            senders.push(tx);
            handles.push(tokio::spawn(drain_into_sink(sink, rx)));
        }

        let streams = sources.iter().cloned().map(read_jsonl).collect();
        let pumped = pump(merge_sorted(streams), &senders).await;
        drop(senders);

        let mut failures = Vec::new();
        let records = match pumped {
            Ok(records) => records,
            Err(e) => {
                failures.push(format!("{e:#}"));
                0
            }
        };

        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failures.push(format!("{e:#}")),
                Err(e) => failures.push(format!("sink task panicked: {e}")),
            }
        }

        if !failures.is_empty() {
            warn!(
                "Log merge failed; keeping {} source files: {}",
                sources.len(),
                failures.join("; ")
            );
            return Err(OrchestratorError::MergeFailure(failures.join("; ")));
        }

        for source in &sources {
            if let Err(e) = tokio::fs::remove_file(source).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!("Failed to remove merged log {}: {}", source.display(), e);
            }
        }

        info!("Merged {} records from {} logs", records, sources.len());
        Ok(MergeSummary {
            sources,
            records,
            skipped: false,
        })
    }
}

/// Feed the merged stream to every sink; stops at the first closed sink
async fn pump(
    mut merged: futures::stream::BoxStream<'static, anyhow::Result<LogRecord>>,
    senders: &[mpsc::Sender<Arc<LogRecord>>],
) -> anyhow::Result<u64> {
    let mut records = 0u64;
    while let Some(record) = merged.try_next().await? {
        let record = Arc::new(record);
        for tx in senders {
            tx.send(Arc::clone(&record))
                .await
                .map_err(|_| anyhow!("a sink stopped before the merge completed"))?;
        }
        records += 1;
    }
    Ok(records)
}

async fn drain_into_sink(
    mut sink: Box<dyn RecordWriter>,
    mut rx: mpsc::Receiver<Arc<LogRecord>>,
) -> anyhow::Result<()> {
    let name = sink.name().to_string();
    while let Some(record) = rx.recv().await {
        sink.write_record(&record)
            .await
            .with_context(|| format!("{name} sink failed to write"))?;
    }
    sink.finish()
        .await
        .with_context(|| format!("{name} sink failed to finish"))
}

fn merge_failure(e: anyhow::Error) -> OrchestratorError {
    OrchestratorError::MergeFailure(format!("{e:#}"))
}

/// Synchronously move raw process logs into `root_dir`
///
/// Used from the emergency teardown path where the async merge cannot run.
/// Returns the new locations of the moved files.
pub fn relocate_logs_sync(root_dir: &Path, sources: &[PathBuf]) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(root_dir)?;

    let mut moved = Vec::new();
    for source in sources.iter().filter(|p| p.exists()) {
        let Some(file_name) = source.file_name() else {
            continue;
        };
        let target = root_dir.join(file_name);

        if std::fs::rename(source, &target).is_err() {
            // Cross-device moves need a copy
            std::fs::copy(source, &target)?;
            std::fs::remove_file(source)?;
        }
        moved.push(target);
    }

    Ok(moved)
}
