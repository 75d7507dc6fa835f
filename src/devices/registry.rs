use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::Platform;
use crate::config::{LOCK_RETRY_ATTEMPTS, LOCK_RETRY_INTERVAL};
use crate::error::{OrchestratorError, Result};

/// One leased device in a registry file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub id: String,
    pub busy: bool,
    pub pid: u32,
}

/// File-backed lease table shared by every process on the host
///
/// Each operation is a read-modify-write of the registry JSON performed while
/// holding an exclusive advisory lock on a sidecar `.lock` file. Entries whose
/// holder process is gone are reclaimed on every locked access.
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    path: PathBuf,
    lock_path: PathBuf,
    pid: u32,
}

impl DeviceRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lock");

        Self {
            path,
            lock_path: PathBuf::from(lock_path),
            pid: std::process::id(),
        }
    }

    pub fn for_platform(dir: &Path, platform: Platform) -> Self {
        Self::new(dir.join(platform.registry_file_name()))
    }

    /// Record leases under another holder pid
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lease the first candidate nobody holds; `None` when all are busy
    pub async fn try_allocate(&self, candidates: &[String]) -> Result<Option<String>> {
        let candidates = candidates.to_vec();
        let pid = self.pid;
        self.locked(move |entries| {
            let free = candidates
                .into_iter()
                .find(|id| !entries.iter().any(|e| e.busy && &e.id == id));

            if let Some(id) = &free {
                entries.push(RegistryEntry {
                    id: id.clone(),
                    busy: true,
                    pid,
                });
            }
            free
        })
        .await
    }

    /// Drop this holder's lease on `id`; returns false when there was none
    pub async fn release(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        let pid = self.pid;
        self.locked(move |entries| {
            let before = entries.len();
            entries.retain(|e| !(e.id == id && e.pid == pid));
            entries.len() != before
        })
        .await
    }

    /// Remove every lease
    ///
    /// The previous contents are never parsed, so this also recovers a
    /// corrupted registry file.
    pub async fn reset(&self) -> Result<()> {
        self.with_lock(|path| write_entries(path, &[])).await
    }

    pub async fn busy_devices(&self) -> Result<Vec<RegistryEntry>> {
        self.locked(|entries| entries.iter().filter(|e| e.busy).cloned().collect())
            .await
    }

    pub async fn is_busy(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.locked(move |entries| entries.iter().any(|e| e.busy && e.id == id))
            .await
    }

    async fn locked<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Vec<RegistryEntry>) -> T + Send + 'static,
    {
        self.with_lock(move |path| modify_entries(path, f)).await
    }

    async fn with_lock<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        let lock_path = self.lock_path.clone();

        tokio::task::spawn_blocking(move || with_file_lock(&path, &lock_path, f))
            .await
            .map_err(|e| OrchestratorError::LockCorruption {
                path: self.path.clone(),
                reason: format!("registry task failed: {e}"),
            })?
    }
}

fn with_file_lock<T>(
    path: &Path,
    lock_path: &Path,
    f: impl FnOnce(&Path) -> Result<T>,
) -> Result<T> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(lock_path)?;
    acquire_lock(&lock_file, path)?;

    let result = f(path);

    if let Err(e) = FileExt::unlock(&lock_file) {
        warn!("Failed to unlock {}: {}", lock_path.display(), e);
    }
    result
}

fn modify_entries<T>(path: &Path, f: impl FnOnce(&mut Vec<RegistryEntry>) -> T) -> Result<T> {
    let mut entries = read_entries(path)?;
    let original = entries.clone();
    reclaim_abandoned(&mut entries, path);
    let value = f(&mut entries);
    if entries != original {
        write_entries(path, &entries)?;
    }
    Ok(value)
}

fn acquire_lock(lock_file: &File, path: &Path) -> Result<()> {
    for attempt in 1..=LOCK_RETRY_ATTEMPTS {
        match lock_file.try_lock_exclusive() {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                debug!(
                    "Registry {} locked by another process (attempt {})",
                    path.display(),
                    attempt
                );
                std::thread::sleep(LOCK_RETRY_INTERVAL);
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(OrchestratorError::LockCorruption {
        path: path.to_path_buf(),
        reason: format!("lock still held after {LOCK_RETRY_ATTEMPTS} attempts"),
    })
}

fn read_entries(path: &Path) -> Result<Vec<RegistryEntry>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    if contents.trim().is_empty() {
        return Ok(Vec::new());
    }

    serde_json::from_str(&contents).map_err(|e| OrchestratorError::LockCorruption {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn write_entries(path: &Path, entries: &[RegistryEntry]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, serde_json::to_vec_pretty(entries)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn reclaim_abandoned(entries: &mut Vec<RegistryEntry>, path: &Path) {
    entries.retain(|entry| {
        let alive = process_alive(entry.pid);
        if !alive {
            warn!(
                "Reclaiming device {} from dead process {} in {}",
                entry.id,
                entry.pid,
                path.display()
            );
        }
        alive
    });
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    if pid == std::process::id() {
        return true;
    }

    // SAFETY: signal 0 performs only the existence and permission checks.
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    result == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(pid: u32) -> bool {
    pid != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Above the kernel's pid_max, so never a live process
    const DEAD_PID: u32 = 99_999_999;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_allocate_skips_busy_devices() {
        let dir = TempDir::new().unwrap();
        let registry = DeviceRegistry::new(dir.path().join("reg.json"));
        let pool = ids(&["a", "b"]);

        assert_eq!(registry.try_allocate(&pool).await.unwrap(), Some("a".into()));
        assert_eq!(registry.try_allocate(&pool).await.unwrap(), Some("b".into()));
        assert_eq!(registry.try_allocate(&pool).await.unwrap(), None);
        assert!(registry.is_busy("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_release_then_reallocate() {
        let dir = TempDir::new().unwrap();
        let registry = DeviceRegistry::new(dir.path().join("reg.json"));
        let pool = ids(&["only"]);

        registry.try_allocate(&pool).await.unwrap();
        assert!(registry.release("only").await.unwrap());
        assert!(!registry.release("only").await.unwrap());
        assert_eq!(registry.try_allocate(&pool).await.unwrap(), Some("only".into()));
    }

    #[tokio::test]
    async fn test_concurrent_allocations_are_exclusive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reg.json");
        let pool = ids(&["shared"]);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                // Separate handles open separate lock descriptors
                let registry = DeviceRegistry::new(&path);
                let pool = pool.clone();
                tokio::spawn(async move { registry.try_allocate(&pool).await.unwrap() })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_release_only_drops_own_lease() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reg.json");
        let mine = DeviceRegistry::new(&path);
        let theirs = DeviceRegistry::new(&path).with_pid(1);

        theirs.try_allocate(&ids(&["x"])).await.unwrap();
        assert!(!mine.release("x").await.unwrap());
        assert!(mine.is_busy("x").await.unwrap());
    }

    #[tokio::test]
    async fn test_dead_holders_are_reclaimed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reg.json");
        std::fs::write(
            &path,
            serde_json::to_string(&vec![RegistryEntry {
                id: "stale".into(),
                busy: true,
                pid: DEAD_PID,
            }])
            .unwrap(),
        )
        .unwrap();

        let registry = DeviceRegistry::new(&path);
        assert_eq!(
            registry.try_allocate(&ids(&["stale"])).await.unwrap(),
            Some("stale".into())
        );
        let busy = registry.busy_devices().await.unwrap();
        assert_eq!(busy.len(), 1);
        assert_eq!(busy[0].pid, std::process::id());
    }

    #[tokio::test]
    async fn test_unparseable_registry_is_lock_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reg.json");
        std::fs::write(&path, "{ definitely not a registry").unwrap();

        let err = DeviceRegistry::new(&path)
            .try_allocate(&ids(&["a"]))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::LockCorruption { .. }));
    }

    #[tokio::test]
    async fn test_reset_clears_everything() {
        let dir = TempDir::new().unwrap();
        let registry = DeviceRegistry::new(dir.path().join("nested").join("reg.json"));
        registry.try_allocate(&ids(&["a"])).await.unwrap();

        registry.reset().await.unwrap();
        assert!(registry.busy_devices().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reset_recovers_corrupted_registry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("android.device.registry.json");
        std::fs::write(&path, "{ garbage").unwrap();

        let registry = DeviceRegistry::new(&path);
        registry.reset().await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap().trim(), "[]");
        assert!(registry.busy_devices().await.unwrap().is_empty());
        assert_eq!(
            registry.try_allocate(&ids(&["emulator-5554"])).await.unwrap(),
            Some("emulator-5554".into())
        );
    }

    #[tokio::test]
    async fn test_held_lock_times_out() {
        let dir = TempDir::new().unwrap();
        let registry = DeviceRegistry::new(dir.path().join("reg.json"));
        let holder = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.path().join("reg.json.lock"))
            .unwrap();
        holder.lock_exclusive().unwrap();

        let err = registry.busy_devices().await.unwrap_err();
        assert!(matches!(err, OrchestratorError::LockCorruption { .. }));

        FileExt::unlock(&holder).unwrap();
        assert!(registry.busy_devices().await.unwrap().is_empty());
    }
}
