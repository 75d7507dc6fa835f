//! IPC bus between the primary process and its workers.
//!
//! The primary hosts a Unix-domain socket named after the session's
//! `ipc_server_id`. Workers connect, register, and receive the session config
//! and workers count as broadcasts; they ship log records and failed-test
//! reports back. Frames are newline-delimited JSON and each connection has a
//! single writer, so delivery is ordered per worker but not across workers.
//! There is no authentication: the endpoint is only reachable on the local host.

use std::path::PathBuf;

use crate::config::TEMP_FILE_PREFIX;

mod client;
mod message;
mod server;

pub use client::IpcClient;
pub use message::{FailedTests, IpcMessage};
pub use server::IpcServer;

/// Socket path of the endpoint named `server_id`
pub fn socket_path_for(server_id: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{TEMP_FILE_PREFIX}.{server_id}.sock"))
}
