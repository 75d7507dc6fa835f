use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

use super::logger::DebugFormatOptions;
use super::record::LogRecord;

/// One projection of the merged record sequence
///
/// Every sink consumes the identical ordering; `finish` must leave the output
/// durably written before it returns.
#[async_trait]
pub trait RecordWriter: Send {
    fn name(&self) -> &str;

    async fn write_record(&mut self, record: &LogRecord) -> Result<()>;

    async fn finish(&mut self) -> Result<()>;
}

async fn create_output(path: &Path) -> Result<BufWriter<File>> {
    let file = File::create(path)
        .await
        .with_context(|| format!("Failed to create {}", path.display()))?;
    Ok(BufWriter::new(file))
}

async fn finish_output(out: &mut BufWriter<File>, path: &Path) -> Result<()> {
    out.flush()
        .await
        .with_context(|| format!("Failed to flush {}", path.display()))?;
    out.get_ref()
        .sync_all()
        .await
        .with_context(|| format!("Failed to sync {}", path.display()))
}

/// Merged JSON-lines log
pub struct JsonlWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

impl JsonlWriter {
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let out = create_output(&path).await?;
        Ok(Self { path, out })
    }
}

#[async_trait]
impl RecordWriter for JsonlWriter {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn write_record(&mut self, record: &LogRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.out.write_all(&line).await?;
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        finish_output(&mut self.out, &self.path).await
    }
}

/// Human-readable merged log
pub struct DebugWriter {
    path: PathBuf,
    out: BufWriter<File>,
    options: DebugFormatOptions,
}

impl DebugWriter {
    pub async fn create(path: impl Into<PathBuf>, options: DebugFormatOptions) -> Result<Self> {
        let path = path.into();
        let out = create_output(&path).await?;
        Ok(Self { path, out, options })
    }

    /// Render one record as a single line (without the trailing newline)
    pub fn format_line(record: &LogRecord, options: &DebugFormatOptions) -> String {
        let mut line = String::new();

        if options.show_date {
            line.push_str(&record.time.format("%Y-%m-%d %H:%M:%S%.3f").to_string());
        } else {
            line.push_str(&record.time.format("%H:%M:%S%.3f").to_string());
        }

        if options.show_pid {
            let pid = record.meta_u64("pid").unwrap_or(0);
            match record.meta_u64("tid") {
                Some(tid) if tid > 0 => line.push_str(&format!(" {pid}:w{tid}")),
                _ => line.push_str(&format!(" {pid}")),
            }
        }

        line.push(' ');
        line.push_str(&record.level.as_str().to_uppercase());

        if options.show_logger_name
            && let Some(cat) = record.meta_str("cat")
        {
            line.push_str(&format!(" [{cat}]"));
        }

        if let Some(ph) = record.meta_str("ph") {
            let marker = match ph {
                "B" => "->",
                "E" => "<-",
                _ => "--",
            };
            line.push(' ');
            line.push_str(marker);
        }

        line.push_str(": ");
        line.push_str(&record.message());

        if options.show_metadata {
            let extra: Map<String, Value> = record
                .meta
                .iter()
                .filter(|(key, _)| !matches!(key.as_str(), "pid" | "tid" | "cat" | "ph" | "name"))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            if !extra.is_empty() {
                line.push(' ');
                line.push_str(&Value::Object(extra).to_string());
            }
        }

        line
    }
}

#[async_trait]
impl RecordWriter for DebugWriter {
    fn name(&self) -> &str {
        "debug"
    }

    async fn write_record(&mut self, record: &LogRecord) -> Result<()> {
        let mut line = Self::format_line(record, &self.options);
        line.push('\n');
        self.out.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        finish_output(&mut self.out, &self.path).await
    }
}

/// Trace-event JSON array for timeline viewers (`chrome://tracing`, Perfetto)
pub struct ChromeTraceWriter {
    path: PathBuf,
    out: BufWriter<File>,
    converter: TraceEventConverter,
    wrote_any: bool,
}

impl ChromeTraceWriter {
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let out = create_output(&path).await?;
        Ok(Self {
            path,
            out,
            converter: TraceEventConverter::default(),
            wrote_any: false,
        })
    }
}

#[async_trait]
impl RecordWriter for ChromeTraceWriter {
    fn name(&self) -> &str {
        "trace"
    }

    async fn write_record(&mut self, record: &LogRecord) -> Result<()> {
        for event in self.converter.convert(record) {
            let prefix: &[u8] = if self.wrote_any { b",\n" } else { b"[\n" };
            self.wrote_any = true;
            self.out.write_all(prefix).await?;
            self.out.write_all(&serde_json::to_vec(&event)?).await?;
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        let suffix: &[u8] = if self.wrote_any { b"\n]\n" } else { b"[]\n" };
        self.out.write_all(suffix).await?;
        finish_output(&mut self.out, &self.path).await
    }
}

/// Maps log records onto trace events, emitting process/thread names once
#[derive(Default)]
pub struct TraceEventConverter {
    seen_processes: HashSet<u64>,
    seen_threads: HashSet<(u64, u64)>,
}

impl TraceEventConverter {
    pub fn convert(&mut self, record: &LogRecord) -> Vec<Value> {
        let pid = record.meta_u64("pid").unwrap_or(0);
        let tid = record.meta_u64("tid").unwrap_or(0);
        let mut events = Vec::new();

        if self.seen_processes.insert(pid) {
            let name = if tid == 0 { "primary" } else { "worker" };
            events.push(json!({
                "ph": "M", "name": "process_name", "pid": pid, "tid": tid,
                "args": { "name": format!("{name} ({pid})") },
            }));
        }
        if self.seen_threads.insert((pid, tid)) {
            let name = if tid == 0 {
                "primary".to_string()
            } else {
                format!("worker {tid}")
            };
            events.push(json!({
                "ph": "M", "name": "thread_name", "pid": pid, "tid": tid,
                "args": { "name": name },
            }));
        }

        let ph = record.meta_str("ph").unwrap_or("i");
        let cat = record.meta_str("cat").unwrap_or("default");
        let ts = record.time.timestamp_micros();
        let data = record.meta.get("data").cloned();

        let event = match ph {
            "B" | "E" => {
                let mut event = json!({
                    "ph": ph, "cat": cat, "pid": pid, "tid": tid, "ts": ts,
                    "args": data.unwrap_or_else(|| json!({})),
                });
                if let Some(name) = record.meta_str("name") {
                    event["name"] = json!(name);
                }
                event
            }
            _ => {
                let message = record.message();
                let name = record
                    .meta_str("name")
                    .map(str::to_string)
                    .unwrap_or_else(|| message.clone());
                let mut args = json!({ "level": record.level.as_str(), "msg": message });
                if let Some(data) = data {
                    args["data"] = data;
                }
                json!({
                    "ph": "i", "s": "t", "name": name, "cat": cat,
                    "pid": pid, "tid": tid, "ts": ts, "args": args,
                })
            }
        };

        events.push(event);
        events
    }
}
