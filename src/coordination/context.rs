use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::devices::{AllocationDriver, DeviceAllocator, DeviceCookie, FreeOptions};
use crate::error::Result;
use crate::logs::Logger;
use crate::session::{RunConfig, SessionState};

/// Options of the per-worker setup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetupOptions {
    /// 1-based index of the worker; defaults to 1
    pub worker_index: Option<usize>,
}

impl SetupOptions {
    pub fn worker(index: usize) -> Self {
        Self {
            worker_index: Some(index),
        }
    }
}

/// Per-worker lifecycle shared by the primary and worker contexts
#[async_trait]
pub trait RunContext: Send {
    async fn setup(&mut self, options: SetupOptions) -> Result<()>;

    async fn teardown(&mut self) -> Result<()>;

    /// Session state as seen by this process, once available
    fn session(&self) -> Option<SessionState>;

    fn logger(&self) -> &Logger;
}

/// Hooks used by the crate's own context wiring, not part of the public surface
pub(crate) trait ContextInternals {
    fn restore_session_state(&mut self, state: SessionState);

    fn worker_runtime_mut(&mut self) -> &mut WorkerRuntime;
}

/// Device lease held by one worker between setup and teardown
pub struct WorkerRuntime {
    registry_dir: PathBuf,
    driver: Arc<dyn AllocationDriver>,
    leased: Option<Lease>,
}

struct Lease {
    allocator: DeviceAllocator,
    cookie: DeviceCookie,
    shutdown_on_free: bool,
}

impl WorkerRuntime {
    pub fn new(registry_dir: impl Into<PathBuf>, driver: Arc<dyn AllocationDriver>) -> Self {
        Self {
            registry_dir: registry_dir.into(),
            driver,
            leased: None,
        }
    }

    /// Allocate the device this worker runs on
    pub async fn setup(&mut self, config: &RunConfig, logger: &Logger) -> Result<()> {
        if self.leased.is_some() {
            return Ok(());
        }
        if !config.device.requires_device() {
            logger.debug("No device required for this run");
            return Ok(());
        }

        let allocator =
            DeviceAllocator::for_config(&self.registry_dir, &config.device, Arc::clone(&self.driver));
        let cookie = allocator.allocate(&config.device).await?;

        let mut meta = serde_json::Map::new();
        meta.insert("data".to_string(), json!({ "device": cookie.id }));
        logger.category("device").log_with(
            crate::logs::LogLevel::Info,
            meta,
            vec![json!(format!("Allocated device {}", cookie.id))],
        );

        self.leased = Some(Lease {
            allocator,
            cookie,
            shutdown_on_free: config.behavior.cleanup.shutdown_device,
        });
        Ok(())
    }

    /// Free the leased device, shutting it down when configured to
    pub async fn teardown(&mut self, logger: &Logger) -> Result<()> {
        let Some(lease) = self.leased.take() else {
            return Ok(());
        };

        let options = FreeOptions {
            shutdown: lease.shutdown_on_free,
        };
        lease.allocator.free(&lease.cookie, options).await?;
        logger
            .category("device")
            .info(format!("Released device {}", lease.cookie.id));
        Ok(())
    }

    pub fn device(&self) -> Option<&DeviceCookie> {
        self.leased.as_ref().map(|lease| &lease.cookie)
    }
}
