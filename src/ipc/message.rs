use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::logs::LogLevel;
use crate::session::SessionState;

/// Frames exchanged between the primary and its workers
///
/// On the wire every frame is one JSON object terminated by `\n`, tagged by
/// `type`. Frames from one connection are handled in the order they were sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum IpcMessage {
    /// Worker -> primary: announce a worker and the log file it writes to
    RegisterWorker {
        worker_id: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        log_file: Option<PathBuf>,
    },

    /// Primary -> workers: the current session state, including the resolved config
    SessionConfig { session: SessionState },

    /// Primary -> workers: highest worker index registered so far
    WorkersCount { value: usize },

    /// Worker -> primary: one log record to append to the primary's log
    Log {
        level: LogLevel,
        #[serde(default)]
        meta: Map<String, Value>,
        #[serde(default)]
        args: Vec<Value>,
    },

    /// Worker -> primary: test files that failed in this worker
    ReportFailedTests {
        test_file_paths: Vec<String>,
        #[serde(default)]
        permanent: bool,
    },
}

impl IpcMessage {
    /// Encode as a single newline-terminated frame
    pub fn encode(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn decode(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim_end())
    }

    /// Short name used in diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            IpcMessage::RegisterWorker { .. } => "registerWorker",
            IpcMessage::SessionConfig { .. } => "sessionConfig",
            IpcMessage::WorkersCount { .. } => "workersCount",
            IpcMessage::Log { .. } => "log",
            IpcMessage::ReportFailedTests { .. } => "reportFailedTests",
        }
    }
}

/// Failed test files accumulated by the primary across all workers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedTests {
    pub test_file_paths: Vec<String>,
    /// True once any worker reported a failure that must not be retried
    pub permanent: bool,
}

impl FailedTests {
    pub fn record(&mut self, paths: impl IntoIterator<Item = String>, permanent: bool) {
        for path in paths {
            if !self.test_file_paths.contains(&path) {
                self.test_file_paths.push(path);
            }
        }
        self.permanent |= permanent;
    }

    pub fn is_empty(&self) -> bool {
        self.test_file_paths.is_empty()
    }
}
