//! Age-based retention for local and remote archives.
//!
//! An archive's age is taken from the timestamp in its name, never from file
//! modification times, so copies keep their age across hosts. An archive is
//! expired once its age reaches the window: with a window of zero days every
//! archive is expired immediately.

use crate::archive::checksum::checksum_path;
use crate::archive::{ArchiveName, CHECKSUM_EXTENSION};
use crate::catalog::LocalArchive;
use crate::config::RetentionConfig;
use crate::transport::RemoteStore;
use crate::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Source of "now", replaceable in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock stuck at one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub local_max_age: Duration,
    pub remote_max_age: Duration,
}

impl RetentionPolicy {
    pub fn from_days(local_days: u32, remote_days: u32) -> Self {
        Self {
            local_max_age: Duration::days(i64::from(local_days)),
            remote_max_age: Duration::days(i64::from(remote_days)),
        }
    }
}

impl From<&RetentionConfig> for RetentionPolicy {
    fn from(config: &RetentionConfig) -> Self {
        Self::from_days(config.local_days, config.remote_days)
    }
}

pub fn is_expired(created_at: DateTime<Utc>, now: DateTime<Utc>, max_age: Duration) -> bool {
    now.signed_duration_since(created_at) >= max_age
}

/// What a retention pass removed, what it kept although expired, and what
/// it could not remove.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: Vec<String>,
    /// Expired but protected, e.g. the only copy of a backup
    pub kept: Vec<String>,
    pub errors: Vec<String>,
}

impl CleanupReport {
    pub fn describe(&self) -> String {
        let mut text = format!("removed {} archive(s)", self.removed.len());
        if !self.kept.is_empty() {
            text.push_str(&format!(
                ", kept {} expired (only copy): {}",
                self.kept.len(),
                self.kept.join(", ")
            ));
        }
        if !self.errors.is_empty() {
            text.push_str(&format!(
                ", {} error(s): {}",
                self.errors.len(),
                self.errors.join("; ")
            ));
        }
        text
    }
}

/// Delete expired local archives together with their checksum files.
///
/// Archives listed in `protected` are never deleted; expired ones among them
/// are reported as kept. Individual failures are collected and do not stop
/// the pass.
pub fn enforce_local(
    archives: &[LocalArchive],
    now: DateTime<Utc>,
    max_age: Duration,
    protected: &[&Path],
) -> CleanupReport {
    let mut report = CleanupReport::default();

    for archive in archives {
        if !is_expired(archive.name.created_at, now, max_age) {
            continue;
        }
        if protected.contains(&archive.path.as_path()) {
            warn!(archive = %archive.path.display(), "Expired archive kept, no other copy exists");
            report.kept.push(archive.name.file_name());
            continue;
        }

        let result = remove_if_present(&archive.path)
            .and_then(|_| remove_if_present(&checksum_path(&archive.path)));
        match result {
            Ok(()) => {
                info!(archive = %archive.path.display(), "Removed expired local archive");
                report.removed.push(archive.name.file_name());
            }
            Err(e) => {
                warn!(archive = %archive.path.display(), "Cannot remove expired archive: {}", e);
                report.errors.push(format!("{}: {}", archive.name, e));
            }
        }
    }

    report
}

/// Delete expired archives (and checksums) from the remote.
///
/// Fails only when the remote cannot be listed at all.
pub async fn enforce_remote(
    store: &dyn RemoteStore,
    now: DateTime<Utc>,
    max_age: Duration,
) -> Result<CleanupReport> {
    let mut report = CleanupReport::default();

    for entry in store.list().await? {
        let Some(name) = ArchiveName::parse(&entry.file_name) else {
            continue;
        };
        if !is_expired(name.created_at, now, max_age) {
            continue;
        }

        let checksum = format!("{}{}", entry.file_name, CHECKSUM_EXTENSION);
        let result = match store.delete(&entry.file_name).await {
            Ok(()) => store.delete(&checksum).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                info!(archive = %entry.file_name, remote = %store.describe(), "Removed expired remote archive");
                report.removed.push(entry.file_name);
            }
            Err(e) => {
                warn!(archive = %entry.file_name, "Cannot remove expired remote archive: {}", e);
                report.errors.push(format!("{}: {}", entry.file_name, e));
            }
        }
    }

    Ok(report)
}

/// Local archives with no complete copy (archive and checksum) on the remote.
///
/// These are the only copy of their backup, typically left behind by a run
/// whose transfer failed.
pub async fn missing_from_remote(
    store: &dyn RemoteStore,
    archives: &[LocalArchive],
) -> Result<Vec<PathBuf>> {
    let remote: HashSet<String> = store.list().await?.into_iter().map(|e| e.file_name).collect();
    Ok(archives
        .iter()
        .filter(|a| {
            !remote.contains(&a.name.file_name()) || !remote.contains(&a.name.checksum_file_name())
        })
        .map(|a| a.path.clone())
        .collect())
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
