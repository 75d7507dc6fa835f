use std::fs::{File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::record::{LogLevel, LogRecord};
use crate::config::TEMP_FILE_PREFIX;

/// Logger settings carried inside the resolved run config
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggerConfig {
    /// Minimum level mirrored to the diagnostic output; the file receives everything
    pub level: LogLevel,
    pub options: DebugFormatOptions,
}

/// Rendering options of the human-readable merged log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DebugFormatOptions {
    pub show_date: bool,
    pub show_pid: bool,
    pub show_logger_name: bool,
    pub show_metadata: bool,
}

impl Default for DebugFormatOptions {
    fn default() -> Self {
        Self {
            show_date: true,
            show_pid: true,
            show_logger_name: true,
            show_metadata: false,
        }
    }
}

struct LoggerInner {
    file: Option<PathBuf>,
    writer: Mutex<Option<LineWriter<File>>>,
    config: RwLock<LoggerConfig>,
}

/// Structured run logger writing JSON lines to a per-process file
///
/// Every record is also mirrored into `tracing`. Writes are synchronous so the
/// emergency teardown path can flush without an async runtime.
#[derive(Clone)]
pub struct Logger {
    inner: Arc<LoggerInner>,
    meta: Map<String, Value>,
}

impl Logger {
    /// Create a fresh per-process log file inside `dir`
    pub fn create_in(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

        let (_, path) = tempfile::Builder::new()
            .prefix(&format!("{TEMP_FILE_PREFIX}.{}.", std::process::id()))
            .suffix(".log.jsonl")
            .tempfile_in(dir)
            .context("Failed to create process log file")?
            .keep()
            .context("Failed to persist process log file")?;

        Self::open(path)
    }

    /// Append to an existing (or new) log file
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;

        Ok(Self::with_parts(Some(path), Some(LineWriter::new(file))))
    }

    /// A logger that only mirrors into `tracing`
    pub fn disabled() -> Self {
        Self::with_parts(None, None)
    }

    fn with_parts(file: Option<PathBuf>, writer: Option<LineWriter<File>>) -> Self {
        let mut meta = Map::new();
        meta.insert("pid".to_string(), json!(std::process::id()));

        Self {
            inner: Arc::new(LoggerInner {
                file,
                writer: Mutex::new(writer),
                config: RwLock::new(LoggerConfig::default()),
            }),
            meta,
        }
    }

    pub fn file(&self) -> Option<&Path> {
        self.inner.file.as_deref()
    }

    pub fn config(&self) -> LoggerConfig {
        self.inner.config.read().clone()
    }

    pub fn set_config(&self, config: LoggerConfig) {
        *self.inner.config.write() = config;
    }

    /// A logger sharing this file whose records carry `meta` in addition
    pub fn child(&self, meta: Map<String, Value>) -> Self {
        let mut merged = self.meta.clone();
        merged.extend(meta);
        Self {
            inner: Arc::clone(&self.inner),
            meta: merged,
        }
    }

    /// Child logger tagged with a category (`cat` key)
    pub fn category(&self, cat: &str) -> Self {
        let mut meta = Map::new();
        meta.insert("cat".to_string(), json!(cat));
        self.child(meta)
    }

    pub fn trace(&self, msg: impl Into<String>) {
        self.log(LogLevel::Trace, msg);
    }

    pub fn debug(&self, msg: impl Into<String>) {
        self.log(LogLevel::Debug, msg);
    }

    pub fn info(&self, msg: impl Into<String>) {
        self.log(LogLevel::Info, msg);
    }

    pub fn warn(&self, msg: impl Into<String>) {
        self.log(LogLevel::Warn, msg);
    }

    pub fn error(&self, msg: impl Into<String>) {
        self.log(LogLevel::Error, msg);
    }

    pub fn fatal(&self, msg: impl Into<String>) {
        self.log(LogLevel::Fatal, msg);
    }

    pub fn log(&self, level: LogLevel, msg: impl Into<String>) {
        self.log_with(level, Map::new(), vec![Value::String(msg.into())]);
    }

    /// Log with extra metadata and raw arguments
    pub fn log_with(&self, level: LogLevel, meta: Map<String, Value>, args: Vec<Value>) {
        let mut merged = self.meta.clone();
        merged.extend(meta);
        self.write_record(&LogRecord::new(level, merged, args));
    }

    /// Append an already-built record (e.g. one shipped from a worker)
    pub fn write_record(&self, record: &LogRecord) {
        self.mirror(record);

        let mut writer = self.inner.writer.lock();
        if let Some(out) = writer.as_mut() {
            let line = match serde_json::to_string(record) {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!("Dropping unserializable log record: {}", e);
                    return;
                }
            };
            if let Err(e) = writeln!(out, "{line}") {
                tracing::warn!("Failed to write run log record: {}", e);
            }
        }
    }

    pub fn flush(&self) {
        if let Some(out) = self.inner.writer.lock().as_mut()
            && let Err(e) = out.flush()
        {
            tracing::warn!("Failed to flush run log: {}", e);
        }
    }

    /// Flush and detach the file; later records only reach `tracing`
    pub fn close(&self) {
        let mut writer = self.inner.writer.lock();
        if let Some(mut out) = writer.take()
            && let Err(e) = out.flush()
        {
            tracing::warn!("Failed to flush run log on close: {}", e);
        }
    }

    fn mirror(&self, record: &LogRecord) {
        if record.level < self.inner.config.read().level {
            return;
        }

        let cat = record.meta_str("cat").unwrap_or("run");
        let message = record.message();
        match record.level {
            LogLevel::Trace => tracing::trace!(cat, "{}", message),
            LogLevel::Debug => tracing::debug!(cat, "{}", message),
            LogLevel::Info => tracing::info!(cat, "{}", message),
            LogLevel::Warn => tracing::warn!(cat, "{}", message),
            LogLevel::Error | LogLevel::Fatal => tracing::error!(cat, "{}", message),
        }
    }
}

/// Begin/end spans recorded into the run log for timeline rendering
#[derive(Clone)]
pub struct Tracer {
    logger: Logger,
}

impl Tracer {
    pub fn new(logger: Logger) -> Self {
        Self { logger }
    }

    pub fn begin(&self, cat: &str, name: &str, data: Value) {
        self.event("B", cat, Some(name), data);
    }

    pub fn end(&self, cat: &str, data: Value) {
        self.event("E", cat, None, data);
    }

    pub fn instant(&self, cat: &str, name: &str, data: Value) {
        self.event("i", cat, Some(name), data);
    }

    fn event(&self, ph: &str, cat: &str, name: Option<&str>, data: Value) {
        let mut meta = Map::new();
        meta.insert("ph".to_string(), json!(ph));
        meta.insert("cat".to_string(), json!(cat));
        if let Some(name) = name {
            meta.insert("name".to_string(), json!(name));
        }
        if !data.is_null() {
            meta.insert("data".to_string(), data);
        }

        let args = match name {
            Some(name) => vec![Value::String(name.to_string())],
            None => Vec::new(),
        };
        self.logger.log_with(LogLevel::Trace, meta, args);
    }
}
