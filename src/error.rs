//! Error taxonomy of the orchestration layer.
//!
//! Setup-phase errors abort the run before any test executes. Teardown-phase
//! errors are logged by the caller and never stop the remaining cleanup, except
//! for a failed device-lock reset which leaves every later worker deadlocked.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Convenience alias for results using the orchestrator error type.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Malformed or missing resolved config or session snapshot.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Global setup was invoked twice on the same primary context.
    #[error("Cannot initialize primary context more than once")]
    DuplicateInitialization,

    /// No candidate device became free before the allocation timeout elapsed.
    #[error("No device available for '{device}' after {timeout:?}")]
    DeviceUnavailable { device: String, timeout: Duration },

    /// The device registry could not be read or locked safely.
    #[error("Device registry at {path} is corrupted: {reason}")]
    LockCorruption { path: PathBuf, reason: String },

    #[error("IPC transport error: {0}")]
    IpcTransport(#[from] IpcTransportError),

    /// A sink failed while merging process logs. Sources are left in place.
    #[error("Failed to merge process logs: {0}")]
    MergeFailure(String),

    /// The environment-specific lifecycle hook failed.
    #[error("Environment lifecycle hook failed: {0:#}")]
    Environment(anyhow::Error),

    /// The auto-started auxiliary server could not be opened.
    #[error("Auxiliary server failed: {0:#}")]
    AuxiliaryServer(anyhow::Error),

    #[error("Device driver error: {0:#}")]
    DeviceDriver(anyhow::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum IpcTransportError {
    /// Another server is bound to the same endpoint (a prior run was not cleaned up).
    #[error("IPC endpoint {0} is already in use")]
    AddressInUse(PathBuf),

    #[error("IPC server already started")]
    AlreadyStarted,

    /// Disposed servers cannot be restarted; a fresh instance is needed per run.
    #[error("IPC server was disposed")]
    Disposed,

    #[error("Could not connect to IPC endpoint {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("IPC connection closed")]
    Closed,

    #[error("IPC I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    /// Whether the caller may retry at a higher level (e.g. with another device).
    pub fn is_retryable(&self) -> bool {
        matches!(self, OrchestratorError::DeviceUnavailable { .. })
    }
}
