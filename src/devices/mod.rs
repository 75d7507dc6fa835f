//! Cross-process device leasing
//!
//! Which device to pick is decided per device type by an [`AllocationDriver`];
//! the lease bookkeeping is always the shared, file-locked [`DeviceRegistry`].

pub mod allocation;
pub mod registry;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use allocation::{AllocationDriver, DeviceAllocator, DeviceCookie, FreeOptions, StaticPoolDriver};
pub use registry::{DeviceRegistry, RegistryEntry};

use crate::config::REGISTRY_DIR_NAME;
use crate::error::Result;

/// Device section of the resolved run config
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceConfig {
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    /// Candidate device identifiers, most preferred first
    pub pool: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocation_timeout_ms: Option<u64>,
}

impl DeviceConfig {
    /// A stub device without a pool runs without leasing anything
    pub fn requires_device(&self) -> bool {
        !(self.device_type == DeviceType::Stub && self.pool.is_empty())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    #[serde(rename = "ios.none")]
    IosNone,
    #[serde(rename = "ios.simulator")]
    IosSimulator,
    #[serde(rename = "android.attached")]
    AndroidAttached,
    #[serde(rename = "android.emulator")]
    AndroidEmulator,
    #[serde(rename = "android.genycloud")]
    AndroidGenycloud,
    #[default]
    #[serde(rename = "stub")]
    Stub,
}

impl DeviceType {
    /// Lock-file namespace used to lease devices of this type
    pub fn platform(&self) -> Platform {
        match self {
            DeviceType::IosNone | DeviceType::IosSimulator => Platform::Ios,
            DeviceType::AndroidAttached
            | DeviceType::AndroidEmulator
            | DeviceType::AndroidGenycloud => Platform::Android,
            DeviceType::Stub => Platform::Stub,
        }
    }

    /// Lock files cleared at the start of a run
    pub fn registries_to_reset(&self) -> Vec<Platform> {
        match self {
            DeviceType::AndroidGenycloud => vec![Platform::Android, Platform::GenycloudShutdown],
            other => vec![other.platform()],
        }
    }
}

/// Namespace of one device lock file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    Android,
    Ios,
    /// Cloud instances awaiting shutdown at the end of the run
    GenycloudShutdown,
    Stub,
}

impl Platform {
    pub fn registry_file_name(&self) -> &'static str {
        match self {
            Platform::Android => "android.device.registry.json",
            Platform::Ios => "ios.device.registry.json",
            Platform::GenycloudShutdown => "genycloud.global-shutdown.registry.json",
            Platform::Stub => "stub.device.registry.json",
        }
    }
}

/// Well-known directory of the device lock files
pub fn default_registry_dir() -> PathBuf {
    std::env::temp_dir().join(REGISTRY_DIR_NAME)
}

/// Clear every lock file used by `device_type`
pub async fn reset_lock_files(registry_dir: &Path, device_type: DeviceType) -> Result<()> {
    for platform in device_type.registries_to_reset() {
        DeviceRegistry::for_platform(registry_dir, platform)
            .reset()
            .await?;
    }
    Ok(())
}
