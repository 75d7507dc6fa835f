use std::path::PathBuf;

use anyhow::{Context, Result};
use async_stream::try_stream;
use futures::stream::BoxStream;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

use super::record::LogRecord;

/// Lazily stream the records of a JSON-lines log file
///
/// Blank lines are skipped. A malformed line fails the stream so the caller
/// never deletes a file it could not fully merge.
pub fn read_jsonl(path: PathBuf) -> BoxStream<'static, Result<LogRecord>> {
    Box::pin(try_stream! {
        let file = File::open(&path)
            .await
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
        let mut lines = BufReader::new(file).lines();
        let mut line_number = 0u64;

        while let Some(line) = lines.next_line().await? {
            line_number += 1;
            if line.trim().is_empty() {
                continue;
            }

            let record: LogRecord = serde_json::from_str(&line).with_context(|| {
                format!("Malformed record at {}:{}", path.display(), line_number)
            })?;
            yield record;
        }
    })
}
