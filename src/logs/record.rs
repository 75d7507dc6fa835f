use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Severity of a run log record
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of a per-process JSON-lines log
///
/// `time` crosses every serialization boundary as an RFC 3339 string and is
/// always parsed back into a comparable instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub time: DateTime<Utc>,
    pub level: LogLevel,
    #[serde(default)]
    pub meta: Map<String, Value>,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl LogRecord {
    pub fn new(level: LogLevel, meta: Map<String, Value>, args: Vec<Value>) -> Self {
        Self {
            time: Utc::now(),
            level,
            meta,
            args,
        }
    }

    /// Build a record from a shipped `{ level, meta, args }` message
    ///
    /// A `time` key inside `meta` is lifted out and normalized; records without
    /// a parseable time are stamped with the receive time.
    pub fn from_wire(level: LogLevel, mut meta: Map<String, Value>, args: Vec<Value>) -> Self {
        let time = match meta.remove("time") {
            Some(Value::String(raw)) => DateTime::parse_from_rfc3339(&raw)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            _ => Utc::now(),
        };

        Self {
            time,
            level,
            meta,
            args,
        }
    }

    /// The record's arguments rendered as one message line
    pub fn message(&self) -> String {
        self.args
            .iter()
            .map(|arg| match arg {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.meta.get(key).and_then(Value::as_str)
    }

    pub fn meta_u64(&self, key: &str) -> Option<u64> {
        self.meta.get(key).and_then(Value::as_u64)
    }
}
