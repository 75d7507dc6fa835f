//! Per-process run logs, trace spans and the post-run merge pipeline

pub mod logger;
pub mod merge;
pub mod pipeline;
pub mod reader;
pub mod record;
pub mod sinks;

pub use logger::{DebugFormatOptions, Logger, LoggerConfig, Tracer};
pub use merge::merge_sorted;
pub use pipeline::{LogMergePipeline, MergeSummary, relocate_logs_sync};
pub use reader::read_jsonl;
pub use record::{LogLevel, LogRecord};
pub use sinks::{ChromeTraceWriter, DebugWriter, JsonlWriter, RecordWriter};
