use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use super::RunConfig;
use crate::config::TEMP_FILE_PREFIX;
use crate::error::{OrchestratorError, Result};

/// Run-wide state persisted to the session snapshot
///
/// Written once by the primary during global setup and read back, read-only,
/// by every worker process. The only mutation after creation is appending a
/// worker's own log file path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub session_id: String,
    /// 0 for the primary, 1..N for workers
    pub worker_index: usize,
    pub config_snapshot_path: PathBuf,
    pub ipc_server_id: String,
    /// Raw logs written by the primary process
    #[serde(default)]
    pub log_files: Vec<PathBuf>,
    /// Raw logs of registered workers, by worker index
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub worker_log_files: BTreeMap<usize, PathBuf>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<RunConfig>,
}

impl SessionState {
    /// Create a fresh state with a process-unique snapshot path
    pub fn create(ipc_server_id: impl Into<String>) -> Self {
        let session_id = Uuid::new_v4().to_string();
        let config_snapshot_path =
            std::env::temp_dir().join(format!("{TEMP_FILE_PREFIX}-{session_id}.session.json"));

        Self {
            session_id,
            worker_index: 0,
            config_snapshot_path,
            ipc_server_id: ipc_server_id.into(),
            log_files: Vec::new(),
            worker_log_files: BTreeMap::new(),
            created_at: Utc::now(),
            config: None,
        }
    }

    pub fn serialize(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn deserialize(contents: &str) -> Result<Self> {
        serde_json::from_str(contents).map_err(|e| {
            OrchestratorError::Configuration(format!("Malformed session snapshot: {e}"))
        })
    }

    /// Append a log file path; duplicates are ignored
    pub fn add_log_file(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.log_files.contains(&path) {
            self.log_files.push(path);
        }
    }

    /// Record the raw log of worker `worker_index`
    pub fn add_worker_log_file(&mut self, worker_index: usize, path: impl Into<PathBuf>) {
        self.worker_log_files.insert(worker_index, path.into());
    }

    /// Every raw log in merge precedence: primary files first, then workers by index
    pub fn merge_sources(&self) -> Vec<PathBuf> {
        let mut sources = self.log_files.clone();
        for path in self.worker_log_files.values() {
            if !sources.contains(path) {
                sources.push(path.clone());
            }
        }
        sources
    }

    /// The resolved config, or a configuration error when it was never resolved
    pub fn run_config(&self) -> Result<&RunConfig> {
        self.config.as_ref().ok_or_else(|| {
            OrchestratorError::Configuration(
                "Session snapshot does not contain a resolved configuration".to_string(),
            )
        })
    }

    /// Persist the snapshot at `config_snapshot_path`
    pub async fn write_snapshot(&self) -> Result<()> {
        if let Some(parent) = self.config_snapshot_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::write(&self.config_snapshot_path, self.serialize()?).await?;
        Ok(())
    }

    /// Rehydrate a snapshot written by the primary
    pub async fn read_snapshot(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).await.map_err(|e| {
            OrchestratorError::Configuration(format!(
                "Failed to read session snapshot {}: {e}",
                path.display()
            ))
        })?;

        Self::deserialize(&contents)
    }

    /// Rehydrate the snapshot whose path is published in `env_var`
    pub async fn from_env(env_var: &str) -> Result<Self> {
        let path = std::env::var_os(env_var).ok_or_else(|| {
            OrchestratorError::Configuration(format!(
                "Environment variable {env_var} is not set; was the primary context initialized?"
            ))
        })?;

        Self::read_snapshot(PathBuf::from(path)).await
    }

    /// Delete the snapshot file; a missing file is not an error
    pub async fn remove_snapshot(&self) -> Result<()> {
        match fs::remove_file(&self.config_snapshot_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
