//! Local archive catalog and backup-source resolution.
//!
//! The backup root holds one directory per origin:
//!
//! ```text
//! <root>/scheduled/backup_full_20261018_030000.tar.zst
//! <root>/scheduled/backup_full_20261018_030000.tar.zst.sha256
//! <root>/manual/backup_database_20261018_141522.tar.zst
//! ```

use crate::archive::checksum::checksum_path;
use crate::archive::{ArchiveName, CHECKSUM_EXTENSION, STAGING_PREFIX};
use crate::transport::RemoteStore;
use crate::{BackupError, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Where a backup run came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    Scheduled,
    Manual,
}

impl Origin {
    pub const ALL: [Origin; 2] = [Origin::Scheduled, Origin::Manual];

    pub fn dir_name(&self) -> &'static str {
        match self {
            Origin::Scheduled => "scheduled",
            Origin::Manual => "manual",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalArchive {
    pub name: ArchiveName,
    pub path: PathBuf,
    pub origin: Origin,
    pub size_bytes: u64,
    pub has_checksum: bool,
}

#[derive(Debug, Clone)]
pub struct Catalog {
    root: PathBuf,
}

impl Catalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, origin: Origin) -> PathBuf {
        self.root.join(origin.dir_name())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for origin in Origin::ALL {
            std::fs::create_dir_all(self.dir(origin))?;
        }
        Ok(())
    }

    /// All published local archives, newest first.
    pub fn list(&self) -> Result<Vec<LocalArchive>> {
        let mut archives = Vec::new();

        for origin in Origin::ALL {
            let dir = self.dir(origin);
            if !dir.is_dir() {
                continue;
            }

            let walker = WalkDir::new(&dir)
                .min_depth(1)
                .max_depth(1)
                .into_iter()
                .filter_entry(|e| !e.file_name().to_string_lossy().starts_with(STAGING_PREFIX));

            for entry in walker {
                let entry = entry.map_err(|e| {
                    BackupError::Io(std::io::Error::other(format!(
                        "cannot scan {}: {}",
                        dir.display(),
                        e
                    )))
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }

                let file_name = entry.file_name().to_string_lossy().to_string();
                let Some(name) = ArchiveName::parse(&file_name) else {
                    continue;
                };
                let path = entry.path().to_path_buf();
                archives.push(LocalArchive {
                    size_bytes: entry.metadata().map(|m| m.len()).unwrap_or(0),
                    has_checksum: checksum_path(&path).is_file(),
                    name,
                    path,
                    origin,
                });
            }
        }

        archives.sort_by(|a, b| b.name.created_at.cmp(&a.name.created_at));
        Ok(archives)
    }

    pub fn latest(&self) -> Result<Option<LocalArchive>> {
        Ok(self.list()?.into_iter().next())
    }

    pub fn find(&self, file_name: &str) -> Result<Option<LocalArchive>> {
        Ok(self
            .list()?
            .into_iter()
            .find(|a| a.name.file_name() == file_name))
    }

    /// Remove staging and scratch directories abandoned by interrupted runs.
    ///
    /// Staging lives under each origin directory; restore and verify scratch
    /// space lives directly under the root. Callers hold the run lock.
    /// `verify` runs without the lock, so its scratch is only removed once
    /// it is older than [`VERIFY_SCRATCH_MAX_AGE`].
    pub fn sweep_staging(&self) -> Result<usize> {
        let mut removed = 0;
        for origin in Origin::ALL {
            removed += sweep_dir(&self.dir(origin), STAGING_PREFIX, Duration::ZERO)?;
        }
        removed += sweep_dir(&self.root, RESTORE_SCRATCH_PREFIX, Duration::ZERO)?;
        removed += sweep_dir(&self.root, VERIFY_SCRATCH_PREFIX, VERIFY_SCRATCH_MAX_AGE)?;
        Ok(removed)
    }
}

/// Scratch directory prefix for restores, created under the backup root.
pub const RESTORE_SCRATCH_PREFIX: &str = ".restore-";
/// Scratch directory prefix for `verify`, created under the backup root.
pub const VERIFY_SCRATCH_PREFIX: &str = ".verify-";
pub const VERIFY_SCRATCH_MAX_AGE: Duration = Duration::from_secs(24 * 3600);

fn sweep_dir(dir: &Path, prefix: &str, min_age: Duration) -> Result<usize> {
    if !dir.is_dir() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(prefix) || !entry.file_type()?.is_dir() {
            continue;
        }
        let age = entry
            .metadata()?
            .modified()?
            .elapsed()
            .unwrap_or(Duration::ZERO);
        if age < min_age {
            debug!(path = %entry.path().display(), "Scratch directory may still be in use");
            continue;
        }
        match std::fs::remove_dir_all(entry.path()) {
            Ok(()) => {
                info!(path = %entry.path().display(), "Removed abandoned scratch directory");
                removed += 1;
            }
            Err(e) => warn!(path = %entry.path().display(), "Cannot remove scratch directory: {}", e),
        }
    }
    Ok(removed)
}

/// How an operator names the archive to verify or restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupSource {
    /// Newest local archive
    Latest,
    /// An archive on the remote, by file name
    Remote(String),
    /// A path, or a file name looked up in the local catalog
    Local(PathBuf),
}

impl BackupSource {
    pub fn parse(value: &str) -> Self {
        if value == "latest" {
            BackupSource::Latest
        } else if let Some(name) = value.strip_prefix("remote:") {
            BackupSource::Remote(name.to_string())
        } else {
            BackupSource::Local(PathBuf::from(value))
        }
    }
}

impl fmt::Display for BackupSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupSource::Latest => f.write_str("latest"),
            BackupSource::Remote(name) => write!(f, "remote:{}", name),
            BackupSource::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Resolve `source` to a local archive path.
///
/// Remote archives (and their checksum, when present) are downloaded into
/// `scratch`.
pub async fn locate(
    source: &BackupSource,
    catalog: &Catalog,
    remote: Option<&dyn RemoteStore>,
    scratch: &Path,
) -> Result<PathBuf> {
    match source {
        BackupSource::Latest => catalog
            .latest()?
            .map(|a| a.path)
            .ok_or_else(|| BackupError::Archive("no local archives found".into())),

        BackupSource::Local(path) => {
            if path.is_file() {
                return Ok(path.clone());
            }
            let name = path.to_string_lossy();
            catalog
                .find(&name)?
                .map(|a| a.path)
                .ok_or_else(|| BackupError::Archive(format!("archive not found: {}", name)))
        }

        BackupSource::Remote(name) => {
            let store = remote.ok_or_else(|| {
                BackupError::Configuration("no remote is configured".into())
            })?;
            if ArchiveName::parse(name).is_none() {
                return Err(BackupError::Archive(format!("not an archive name: {}", name)));
            }
            if !store.exists(name).await? {
                return Err(BackupError::Archive(format!(
                    "{} not found on {}",
                    name,
                    store.describe()
                )));
            }

            let local = scratch.join(name);
            store.download(name, &local).await?;

            let checksum_name = format!("{}{}", name, CHECKSUM_EXTENSION);
            if store.exists(&checksum_name).await? {
                store.download(&checksum_name, &checksum_path(&local)).await?;
            } else {
                debug!(archive = %name, "Remote archive has no checksum file");
            }
            Ok(local)
        }
    }
}
