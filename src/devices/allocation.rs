use std::sync::Arc;
use std::time::Duration;

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::registry::DeviceRegistry;
use super::{DeviceConfig, Platform};
use crate::config::{ALLOCATION_POLL_INTERVAL, DEFAULT_ALLOCATION_TIMEOUT};
use crate::error::{OrchestratorError, Result};

/// Handle to a leased device, owned by the worker that allocated it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCookie {
    pub id: String,
    pub platform: Platform,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreeOptions {
    /// Also power the device down through the driver
    pub shutdown: bool,
}

/// Device-type specific part of allocation
///
/// Implementations decide which devices are eligible and how to bring them up
/// or down. Lease bookkeeping is never their concern.
#[async_trait]
pub trait AllocationDriver: Send + Sync {
    /// Eligible device identifiers for `config`, most preferred first
    async fn candidates(&self, config: &DeviceConfig) -> AnyResult<Vec<String>>;

    /// Prepare a device that was just leased
    async fn prepare(&self, _device_id: &str, _config: &DeviceConfig) -> AnyResult<()> {
        Ok(())
    }

    /// Power the device down
    async fn shutdown(&self, cookie: &DeviceCookie) -> AnyResult<()>;
}

/// Allocates from the fixed `pool` list of the device config
#[derive(Debug, Clone, Default)]
pub struct StaticPoolDriver;

#[async_trait]
impl AllocationDriver for StaticPoolDriver {
    async fn candidates(&self, config: &DeviceConfig) -> AnyResult<Vec<String>> {
        Ok(config.pool.clone())
    }

    async fn shutdown(&self, cookie: &DeviceCookie) -> AnyResult<()> {
        debug!("Static pool device {} needs no shutdown", cookie.id);
        Ok(())
    }
}

/// Leases devices through the shared registry with bounded retry
pub struct DeviceAllocator {
    registry: DeviceRegistry,
    platform: Platform,
    driver: Arc<dyn AllocationDriver>,
    poll_interval: Duration,
}

impl DeviceAllocator {
    pub fn new(registry: DeviceRegistry, platform: Platform, driver: Arc<dyn AllocationDriver>) -> Self {
        Self {
            registry,
            platform,
            driver,
            poll_interval: ALLOCATION_POLL_INTERVAL,
        }
    }

    /// Allocator over the platform lock file of `config`'s device type
    pub fn for_config(
        registry_dir: &std::path::Path,
        config: &DeviceConfig,
        driver: Arc<dyn AllocationDriver>,
    ) -> Self {
        let platform = config.device_type.platform();
        Self::new(DeviceRegistry::for_platform(registry_dir, platform), platform, driver)
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Allocate using the timeout configured for the device
    pub async fn allocate(&self, config: &DeviceConfig) -> Result<DeviceCookie> {
        let timeout = config
            .allocation_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_ALLOCATION_TIMEOUT);
        self.allocate_within(config, timeout).await
    }

    /// Retry until a candidate is free or `timeout` elapses
    ///
    /// Busy devices are expected while other workers hold them. Mutual
    /// exclusion is guaranteed, fairness is not.
    pub async fn allocate_within(
        &self,
        config: &DeviceConfig,
        timeout: Duration,
    ) -> Result<DeviceCookie> {
        let deadline = Instant::now() + timeout;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let candidates = self
                .driver
                .candidates(config)
                .await
                .map_err(OrchestratorError::DeviceDriver)?;

            if candidates.is_empty() {
                return Err(OrchestratorError::DeviceUnavailable {
                    device: format!("{:?}", config.device_type),
                    timeout,
                });
            }

            if let Some(id) = self.registry.try_allocate(&candidates).await? {
                if let Err(e) = self.driver.prepare(&id, config).await {
                    self.registry.release(&id).await?;
                    return Err(OrchestratorError::DeviceDriver(e));
                }

                info!("Allocated device {} after {} attempt(s)", id, attempts);
                return Ok(DeviceCookie {
                    id,
                    platform: self.platform,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "No free device among {:?} after {} attempts",
                    candidates, attempts
                );
                return Err(OrchestratorError::DeviceUnavailable {
                    device: candidates.join(","),
                    timeout,
                });
            }

            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Release the lease; freeing an already-free cookie does nothing
    pub async fn free(&self, cookie: &DeviceCookie, options: FreeOptions) -> Result<()> {
        if !self.registry.release(&cookie.id).await? {
            debug!("Device {} already free", cookie.id);
            return Ok(());
        }

        if options.shutdown {
            info!("Shutting down device {}", cookie.id);
            self.driver
                .shutdown(cookie)
                .await
                .map_err(OrchestratorError::DeviceDriver)?;
        }
        Ok(())
    }
}
