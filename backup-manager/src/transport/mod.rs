//! Off-host copies of sealed archives.
//!
//! A [`RemoteStore`] must make uploads atomic: a reader on the remote side
//! sees either the complete file under its final name or nothing.

pub mod directory;
pub mod ssh;

use crate::archive::SealedArchive;
use crate::config::{RemoteConfig, RemoteKind};
use crate::{BackupError, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub use directory::DirectoryStore;
pub use ssh::SshStore;

/// A file on the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub file_name: String,
    pub size_bytes: Option<u64>,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Human-readable location, for logs and summaries.
    fn describe(&self) -> String;

    /// Copy `local` to the remote as `remote_name`, atomically.
    async fn upload(&self, local: &Path, remote_name: &str) -> Result<()>;

    async fn download(&self, remote_name: &str, local: &Path) -> Result<()>;

    async fn exists(&self, remote_name: &str) -> Result<bool>;

    async fn list(&self) -> Result<Vec<RemoteEntry>>;

    async fn delete(&self, remote_name: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResult {
    pub remote: String,
    pub bytes: u64,
    /// Whether the local copy was removed after confirmation
    pub local_removed: bool,
}

/// Build the configured remote store.
pub fn from_config(remote: &RemoteConfig) -> Result<Arc<dyn RemoteStore>> {
    match remote.kind {
        RemoteKind::Directory => Ok(Arc::new(DirectoryStore::new(&remote.path))),
        RemoteKind::Ssh => {
            let missing = |field: &str| {
                BackupError::Configuration(format!("remote.{} is required for ssh remotes", field))
            };
            Ok(Arc::new(SshStore::new(
                remote.host.clone().ok_or_else(|| missing("host"))?,
                remote.port,
                remote.user.clone().ok_or_else(|| missing("user"))?,
                remote.key_path.clone().ok_or_else(|| missing("key_path"))?,
                remote.path.clone(),
                Duration::from_secs(remote.connect_timeout_secs),
            )))
        }
    }
}

/// Copy a sealed archive and its checksum to `store`.
///
/// The local copy is removed only when `keep_local` is false and both files
/// are confirmed present on the remote. On any transfer error the local copy
/// is left untouched.
pub async fn transfer(
    store: &dyn RemoteStore,
    archive: &SealedArchive,
    keep_local: bool,
) -> Result<TransferResult> {
    let archive_name = archive.name.file_name();
    let checksum_name = archive.name.checksum_file_name();
    info!(archive = %archive_name, remote = %store.describe(), "Transferring archive");

    store
        .upload(&archive.path, &archive_name)
        .await
        .map_err(|e| as_transfer(e, &archive_name))?;
    store
        .upload(&archive.checksum_path, &checksum_name)
        .await
        .map_err(|e| as_transfer(e, &checksum_name))?;

    for name in [&archive_name, &checksum_name] {
        let present = store.exists(name).await.map_err(|e| as_transfer(e, name))?;
        if !present {
            return Err(BackupError::Transfer(format!(
                "{} not found on {} after upload",
                name,
                store.describe()
            )));
        }
    }

    let mut local_removed = false;
    if !keep_local {
        let removed = std::fs::remove_file(&archive.path)
            .and_then(|_| std::fs::remove_file(&archive.checksum_path));
        match removed {
            Ok(()) => local_removed = true,
            Err(e) => warn!(archive = %archive.path.display(), "Cannot remove local copy: {}", e),
        }
    }

    info!(archive = %archive_name, local_removed, "Transfer complete");
    Ok(TransferResult {
        remote: store.describe(),
        bytes: archive.size_bytes,
        local_removed,
    })
}

fn as_transfer(error: BackupError, name: &str) -> BackupError {
    match error {
        BackupError::Transfer(_) => error,
        other => BackupError::Transfer(format!("{}: {}", name, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{seal, ArchiveName, ArtifactKind, BackupKind, StagedArtifact};
    use crate::testing::FailingStore;
    use chrono::Utc;
    use tempfile::TempDir;

    fn sealed(dest: &Path) -> SealedArchive {
        let staging = TempDir::new_in(dest).unwrap();
        let dump = staging.path().join("database.sql");
        std::fs::write(&dump, b"SELECT 1;").unwrap();
        let artifacts = vec![StagedArtifact {
            kind: ArtifactKind::Database,
            path: dump,
        }];
        let name = ArchiveName::new(BackupKind::Database, Utc::now());
        seal(staging.path(), dest, &name, "host-a", &artifacts, 3).unwrap()
    }

    #[tokio::test]
    async fn test_transfer_moves_archive_when_not_keeping_local() {
        let local = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        let archive = sealed(local.path());
        let store = DirectoryStore::new(remote.path());

        let result = transfer(&store, &archive, false).await.unwrap();

        assert!(result.local_removed);
        assert!(!archive.path.exists());
        assert!(!archive.checksum_path.exists());
        assert!(store.exists(&archive.name.file_name()).await.unwrap());
        assert!(store.exists(&archive.name.checksum_file_name()).await.unwrap());
    }

    #[tokio::test]
    async fn test_transfer_keeps_local_when_configured() {
        let local = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        let archive = sealed(local.path());

        let result = transfer(&DirectoryStore::new(remote.path()), &archive, true)
            .await
            .unwrap();
        assert!(!result.local_removed);
        assert!(archive.path.exists());
    }

    #[tokio::test]
    async fn test_failed_transfer_keeps_local_copy() {
        let local = TempDir::new().unwrap();
        let archive = sealed(local.path());

        let err = transfer(&FailingStore, &archive, false).await.unwrap_err();
        assert!(matches!(err, BackupError::Transfer(_)));
        assert!(archive.path.exists());
        assert!(archive.checksum_path.exists());
    }
}
