//! Single-run lock.
//!
//! Backup, restore and cleanup runs take an exclusive lease file in the
//! backup root. A lease left behind by a crashed run is broken when it is
//! older than the configured maximum age, or when it was taken on this host
//! by a process that no longer exists.

use crate::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

pub const LOCK_FILE: &str = ".stack-backup.lock";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockLease {
    pub run_id: Uuid,
    pub pid: u32,
    pub host: String,
    pub operation: String,
    pub acquired_at: DateTime<Utc>,
}

/// Held for the lifetime of a run; the lease file is removed on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    lease: LockLease,
}

impl RunLock {
    pub fn acquire(dir: &Path, operation: &str, max_age: Duration) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(LOCK_FILE);
        let lease = LockLease {
            run_id: Uuid::new_v4(),
            pid: std::process::id(),
            host: local_host(),
            operation: operation.to_string(),
            acquired_at: Utc::now(),
        };

        // Second attempt only after breaking a stale lease
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(&serde_json::to_vec(&lease)?)?;
                    file.sync_all()?;
                    debug!(run_id = %lease.run_id, operation, "Run lock acquired");
                    return Ok(Self { path, lease });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = read_lease(&path);
                    match &holder {
                        Some(existing) if !is_stale(existing, Utc::now(), max_age) => {
                            return Err(BackupError::AlreadyRunning(format!(
                                "{} started at {} by pid {} on {}",
                                existing.operation, existing.acquired_at, existing.pid, existing.host
                            )));
                        }
                        Some(existing) => warn!(
                            operation = %existing.operation,
                            pid = existing.pid,
                            acquired_at = %existing.acquired_at,
                            "Breaking stale run lock"
                        ),
                        None => warn!(path = %path.display(), "Breaking unreadable run lock"),
                    }
                    match std::fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(BackupError::AlreadyRunning(format!(
            "lock {} was taken by another run",
            path.display()
        )))
    }

    pub fn lease(&self) -> &LockLease {
        &self.lease
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        // Only remove the file if it still holds our lease
        if read_lease(&self.path).is_some_and(|l| l.run_id == self.lease.run_id) {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), "Failed to release run lock: {}", e);
            }
        }
    }
}

fn read_lease(path: &Path) -> Option<LockLease> {
    let content = std::fs::read(path).ok()?;
    serde_json::from_slice(&content).ok()
}

fn local_host() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

pub fn is_stale(lease: &LockLease, now: DateTime<Utc>, max_age: Duration) -> bool {
    let age = now.signed_duration_since(lease.acquired_at);
    let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
    if age > max_age {
        return true;
    }
    lease.host == local_host() && !process_alive(lease.pid)
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        // Exists but belongs to someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_second_acquire_fails_while_held() {
        let dir = TempDir::new().unwrap();
        let lock = RunLock::acquire(dir.path(), "backup", HOUR).unwrap();
        assert_eq!(lock.lease().operation, "backup");

        let err = RunLock::acquire(dir.path(), "restore", HOUR).unwrap_err();
        assert!(matches!(err, BackupError::AlreadyRunning(_)));
        assert_eq!(err.exit_code(), 7);
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = TempDir::new().unwrap();
        {
            let _lock = RunLock::acquire(dir.path(), "backup", HOUR).unwrap();
            assert!(dir.path().join(LOCK_FILE).exists());
        }
        assert!(!dir.path().join(LOCK_FILE).exists());
        assert!(RunLock::acquire(dir.path(), "backup", HOUR).is_ok());
    }

    #[test]
    fn test_old_lease_is_broken() {
        let dir = TempDir::new().unwrap();
        let stale = LockLease {
            run_id: Uuid::new_v4(),
            pid: std::process::id(),
            host: local_host(),
            operation: "backup".into(),
            acquired_at: Utc::now() - chrono::Duration::hours(7),
        };
        std::fs::write(dir.path().join(LOCK_FILE), serde_json::to_vec(&stale).unwrap()).unwrap();

        let lock = RunLock::acquire(dir.path(), "backup", Duration::from_secs(6 * 3600)).unwrap();
        assert_ne!(lock.lease().run_id, stale.run_id);
    }

    #[test]
    fn test_lease_of_dead_local_process_is_stale() {
        let lease = LockLease {
            run_id: Uuid::new_v4(),
            // Above the default pid_max
            pid: 4_000_000,
            host: local_host(),
            operation: "backup".into(),
            acquired_at: Utc::now(),
        };
        assert!(is_stale(&lease, Utc::now(), HOUR));

        let remote_host = LockLease {
            host: "some-other-host".into(),
            ..lease
        };
        assert!(!is_stale(&remote_host, Utc::now(), HOUR));
    }

    #[test]
    fn test_unreadable_lock_is_replaced() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(LOCK_FILE), b"garbage").unwrap();
        assert!(RunLock::acquire(dir.path(), "cleanup", HOUR).is_ok());
    }
}
