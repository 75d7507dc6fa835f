use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::devices::DeviceConfig;
use crate::logs::LoggerConfig;

/// Fully resolved run configuration
///
/// Produced once by the primary's config resolver, persisted inside the session
/// snapshot and broadcast to every worker on registration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunConfig {
    pub behavior: BehaviorConfig,
    pub device: DeviceConfig,
    pub logger: LoggerConfig,
    pub session: SessionConfig,
    pub artifacts: ArtifactsConfig,
}

impl RunConfig {
    /// Whether per-process logs should be merged into artifacts at teardown
    ///
    /// Requires an artifacts root and a log plugin that is not `"none"`.
    /// When false, raw per-process log files are left untouched.
    pub fn logs_enabled(&self) -> bool {
        self.artifacts.root_dir.is_some() && self.artifacts.plugins.log.is_enabled()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BehaviorConfig {
    pub init: InitBehavior,
    pub cleanup: CleanupBehavior,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InitBehavior {
    /// Keep existing device leases instead of resetting the lock files (re-entrant CI)
    pub keep_lock_file: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CleanupBehavior {
    /// Power down allocated devices when a worker frees them
    pub shutdown_device: bool,
}

/// Settings of the auxiliary session server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    pub auto_start: bool,
    /// Address of the session server, e.g. `ws://localhost:8099`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ArtifactsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_dir: Option<PathBuf>,
    pub plugins: ArtifactPlugins,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactPlugins {
    pub log: LogPluginConfig,
}

/// Log artifact plugin: either a preset name (`"none"`, `"all"`, `"failing"`)
/// or an explicit `{ "enabled": bool }` object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LogPluginConfig {
    Preset(String),
    Settings { enabled: bool },
}

impl Default for LogPluginConfig {
    fn default() -> Self {
        LogPluginConfig::Preset("none".to_string())
    }
}

impl LogPluginConfig {
    pub fn is_enabled(&self) -> bool {
        match self {
            LogPluginConfig::Preset(preset) => preset != "none",
            LogPluginConfig::Settings { enabled } => *enabled,
        }
    }
}
