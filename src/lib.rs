// Public API - the runner plus the building blocks a test harness embeds
pub mod runner;

pub mod config;
pub mod coordination;
pub mod devices;
pub mod error;
pub mod ipc;
pub mod logs;
pub mod session;
pub mod telemetry;

pub use error::{IpcTransportError, OrchestratorError, Result};

#[cfg(test)]
mod integ_tests;
