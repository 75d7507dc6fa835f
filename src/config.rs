//! Configuration constants for the run orchestrator
//!
//! This module centralizes all tunable parameters and constants used throughout
//! the application.

use std::time::Duration;

// ============================================================================
// Session Configuration
// ============================================================================

/// Environment variable publishing the session snapshot path to child processes
pub const SNAPSHOT_PATH_ENV: &str = "E2E_CONDUCTOR_SNAPSHOT_PATH";

/// Environment variable carrying the 1-based worker index to a worker process
pub const WORKER_INDEX_ENV: &str = "E2E_CONDUCTOR_WORKER_INDEX";

/// Prefix for every temporary file the orchestrator creates
pub const TEMP_FILE_PREFIX: &str = "e2e-conductor";

// ============================================================================
// IPC Configuration
// ============================================================================

/// Delay between connection attempts of a worker to the primary's endpoint
pub const IPC_CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Total time a worker keeps retrying to reach the primary
///
/// Workers are usually spawned after the primary is listening, so this only
/// covers slow socket creation on loaded CI hosts.
pub const IPC_CONNECT_TIMEOUT: Duration = Duration::from_millis(1500);

/// How long a worker waits for the first configuration broadcast after registering
pub const IPC_CONFIG_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Device Registry Configuration
// ============================================================================

/// Number of attempts to take the registry file lock before giving up
///
/// The lock is only held for a read-modify-write of a small JSON file, so a
/// contended lock clears within a few milliseconds.
pub const LOCK_RETRY_ATTEMPTS: u32 = 50;

/// Pause between two attempts to take the registry file lock
pub const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// Pause between two allocation attempts while every candidate device is busy
pub const ALLOCATION_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Default allocation timeout when the device config does not specify one
pub const DEFAULT_ALLOCATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Sub-directory of the temp dir holding device lock files
pub const REGISTRY_DIR_NAME: &str = "e2e-conductor-locks";

// ============================================================================
// Log Merge Configuration
// ============================================================================

/// Base name of the merged artifacts (`<name>.log.jsonl`, `<name>.log`, `<name>.trace.json`)
pub const MERGED_LOG_NAME: &str = "e2e";

/// Capacity of the per-sink channel fed by the merged record stream
///
/// The slowest sink applies backpressure to the merge through this bound, so
/// memory stays flat no matter how large the source logs are.
pub const SINK_CHANNEL_CAPACITY: usize = 1024;
