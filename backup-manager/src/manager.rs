//! Backup runs, retention passes and archive verification.

use crate::archive::{self, seal, ArchiveName, BackupKind, Manifest, SealedArchive, Verification, STAGING_PREFIX};
use crate::catalog::{self, BackupSource, Catalog, LocalArchive, Origin, VERIFY_SCRATCH_PREFIX};
use crate::config::Config;
use crate::credentials::LiveCredentials;
use crate::lock::RunLock;
use crate::retention::{enforce_local, enforce_remote, missing_from_remote, Clock, RetentionPolicy};
use crate::snapshot::{SnapshotOutcome, SnapshotProducer, SnapshotSettings};
use crate::stack::Stack;
use crate::summary::{Outcome, RunSummary, TRANSFER};
use crate::transport::{self, RemoteEntry, RemoteStore};
use crate::utils::format::format_bytes;
use crate::{BackupError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

const LOCAL_RETENTION: &str = "local-retention";
const REMOTE_RETENTION: &str = "remote-retention";

/// Outcome of `verify`.
#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub archive: PathBuf,
    pub checksum: String,
    pub manifest: Manifest,
}

pub struct BackupManager {
    config: Config,
    stack: Arc<dyn Stack>,
    remote: Option<Arc<dyn RemoteStore>>,
    clock: Arc<dyn Clock>,
    host: String,
}

impl BackupManager {
    pub fn new(
        config: Config,
        stack: Arc<dyn Stack>,
        remote: Option<Arc<dyn RemoteStore>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            config,
            stack,
            remote,
            clock,
            host,
        }
    }

    pub fn catalog(&self) -> Catalog {
        Catalog::new(&self.config.backup.root_dir)
    }

    fn keep_local(&self) -> bool {
        self.config.remote.as_ref().is_some_and(|r| r.keep_local)
    }

    fn lock(&self, operation: &str) -> Result<RunLock> {
        RunLock::acquire(
            &self.config.backup.root_dir,
            operation,
            self.config.backup.lock_max_age(),
        )
    }

    /// Snapshot, seal, transfer and apply retention.
    ///
    /// Problems before any service is touched (lock, configuration) come back
    /// as `Err`. Everything after that is reported in the summary.
    pub async fn run_backup(&self, kind: BackupKind, origin: Origin) -> Result<RunSummary> {
        let lock = self.lock("backup")?;
        let catalog = self.catalog();
        catalog.ensure_dirs()?;
        match catalog.sweep_staging() {
            Ok(0) => {}
            Ok(n) => info!(removed = n, "Cleaned up abandoned staging directories"),
            Err(e) => warn!("Cannot sweep staging directories: {}", e),
        }

        let credentials = LiveCredentials::load(&self.config.env_file())?;
        let name = ArchiveName::new(kind, self.clock.now());
        let mut summary = RunSummary::new(format!("backup {}", kind));
        info!(run_id = %lock.lease().run_id, archive = %name, %origin, "Starting backup");

        match self.snapshot_and_seal(&name, &catalog.dir(origin), &credentials, &mut summary).await {
            Ok(sealed) => {
                summary.archive = Some(sealed.path.clone());
                let transferred = self.transfer(&sealed, &mut summary).await;
                // The only copy of a fresh archive is never subject to retention
                let fresh = (!transferred).then_some(sealed.path.as_path());
                self.apply_retention(fresh, &mut summary).await;
            }
            Err(e) => {
                error!("Backup failed: {}", e);
                summary.fail(e);
            }
        }

        summary.finish();
        info!(status = %summary.status(), "Backup finished");
        Ok(summary)
    }

    async fn snapshot_and_seal(
        &self,
        name: &ArchiveName,
        dest: &Path,
        credentials: &LiveCredentials,
        summary: &mut RunSummary,
    ) -> Result<SealedArchive> {
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(dest)?;
        let producer = SnapshotProducer::new(
            self.stack.clone(),
            self.config.stack.clone(),
            SnapshotSettings::from(&self.config.backup),
            self.config.env_file(),
        );

        let mut staged = Vec::new();
        for kind in name.kind.artifact_kinds() {
            let outcome = match producer.produce(*kind, staging.path(), credentials).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    summary.failed(kind.as_str(), e.to_string());
                    return Err(e);
                }
            };
            match outcome {
                SnapshotOutcome::Produced(artifact) => {
                    let size = std::fs::metadata(&artifact.path)?.len();
                    summary.ok(kind.as_str(), format_bytes(size));
                    staged.push(artifact);
                }
                SnapshotOutcome::NotApplicable(reason) => summary.skipped(kind.as_str(), reason),
                SnapshotOutcome::Skipped(reason) => {
                    summary.record(kind.as_str(), Outcome::SkippedWithWarning(reason))
                }
                SnapshotOutcome::Failed(reason) => summary.failed(kind.as_str(), reason),
            }
        }

        if staged.is_empty() {
            return Err(BackupError::Snapshot("no artifacts were captured".into()));
        }

        let staging_path = staging.path().to_path_buf();
        let dest = dest.to_path_buf();
        let archive_name = name.clone();
        let host = self.host.clone();
        let level = self.config.backup.compression_level;
        let sealed = tokio::task::spawn_blocking(move || {
            let sealed = seal(&staging_path, &dest, &archive_name, &host, &staged, level)?;
            // Round-trip check before the archive is trusted
            match archive::verify(&sealed.path)? {
                Verification::Valid { .. } => Ok(sealed),
                other => Err(BackupError::Integrity(format!(
                    "{} failed verification right after sealing: {:?}",
                    sealed.path.display(),
                    other
                ))),
            }
        })
        .await??;
        drop(staging);

        summary.ok("archive", format_bytes(sealed.size_bytes));
        Ok(sealed)
    }

    /// Returns whether the archive is safely off-host.
    async fn transfer(&self, sealed: &SealedArchive, summary: &mut RunSummary) -> bool {
        let Some(store) = &self.remote else {
            summary.skipped(TRANSFER, "no remote configured");
            return false;
        };

        match transport::transfer(store.as_ref(), sealed, self.keep_local()).await {
            Ok(result) => {
                let detail = if result.local_removed {
                    format!("{}; local copy removed", result.remote)
                } else {
                    result.remote
                };
                summary.ok(TRANSFER, detail);
                true
            }
            Err(e) => {
                error!(archive = %sealed.path.display(), "Transfer failed, keeping local copy: {}", e);
                summary.failed(TRANSFER, format!("{}; local copy kept", e));
                false
            }
        }
    }

    async fn apply_retention(&self, fresh: Option<&Path>, summary: &mut RunSummary) {
        let policy = RetentionPolicy::from(&self.config.retention);
        let now = self.clock.now();

        match self.catalog().list() {
            Ok(archives) => {
                let mut protected: Vec<PathBuf> = fresh.map(Path::to_path_buf).into_iter().collect();
                if let Some(store) = &self.remote {
                    // Archives never confirmed on the remote are the only copy
                    match missing_from_remote(store.as_ref(), &archives).await {
                        Ok(missing) => protected.extend(missing),
                        Err(e) => {
                            warn!("Cannot list remote, keeping every local archive: {}", e);
                            protected.extend(archives.iter().map(|a| a.path.clone()));
                        }
                    }
                }
                let protected: Vec<&Path> = protected.iter().map(PathBuf::as_path).collect();
                let report = enforce_local(&archives, now, policy.local_max_age, &protected);
                if report.errors.is_empty() {
                    summary.ok(LOCAL_RETENTION, report.describe());
                } else {
                    summary.failed(LOCAL_RETENTION, report.describe());
                }
            }
            Err(e) => summary.failed(LOCAL_RETENTION, e.to_string()),
        }

        let Some(store) = &self.remote else {
            return;
        };
        match enforce_remote(store.as_ref(), now, policy.remote_max_age).await {
            Ok(report) if report.errors.is_empty() => summary.ok(REMOTE_RETENTION, report.describe()),
            Ok(report) => summary.failed(REMOTE_RETENTION, report.describe()),
            Err(e) => summary.failed(REMOTE_RETENTION, e.to_string()),
        }
    }

    /// Retention only, without taking a backup.
    pub async fn cleanup(&self) -> Result<RunSummary> {
        let _lock = self.lock("cleanup")?;
        let mut summary = RunSummary::new("cleanup");
        match self.catalog().sweep_staging() {
            Ok(n) => summary.ok("staging", format!("removed {} abandoned dir(s)", n)),
            Err(e) => summary.failed("staging", e.to_string()),
        }
        self.apply_retention(None, &mut summary).await;
        summary.finish();
        Ok(summary)
    }

    pub fn list_local(&self) -> Result<Vec<LocalArchive>> {
        self.catalog().list()
    }

    pub async fn list_remote(&self) -> Result<Vec<RemoteEntry>> {
        let store = self
            .remote
            .as_ref()
            .ok_or_else(|| BackupError::Configuration("no remote is configured".into()))?;
        let mut entries = store.list().await?;
        entries.retain(|e| ArchiveName::parse(&e.file_name).is_some());
        entries.sort_by(|a, b| b.file_name.cmp(&a.file_name));
        Ok(entries)
    }

    /// Check an archive's checksum and manifest without restoring it.
    pub async fn verify(&self, source: &BackupSource) -> Result<VerifyReport> {
        let root = &self.config.backup.root_dir;
        std::fs::create_dir_all(root)?;
        let scratch = tempfile::Builder::new().prefix(VERIFY_SCRATCH_PREFIX).tempdir_in(root)?;
        let archive = catalog::locate(source, &self.catalog(), self.remote.as_deref(), scratch.path()).await?;

        let path = archive.clone();
        let verification = tokio::task::spawn_blocking(move || archive::verify(&path)).await??;
        let checksum = match verification {
            Verification::Valid { checksum } => checksum,
            Verification::Missing { actual } => {
                return Err(BackupError::Integrity(format!(
                    "{} has no checksum file (sha256 {})",
                    archive.display(),
                    actual
                )))
            }
            Verification::Mismatch { expected, actual } => {
                return Err(BackupError::Integrity(format!(
                    "checksum mismatch for {}: expected {}, got {}",
                    archive.display(),
                    expected,
                    actual
                )))
            }
        };

        let path = archive.clone();
        let manifest = tokio::task::spawn_blocking(move || archive::read_manifest(&path)).await??;
        info!(archive = %archive.display(), "Archive verified");
        Ok(VerifyReport {
            archive,
            checksum,
            manifest,
        })
    }
}
