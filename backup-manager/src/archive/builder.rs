//! Sealing staged artifacts into a published archive.
//!
//! Everything is written inside the run's private staging directory first.
//! Only once the archive is complete and its digest computed are the checksum
//! file and then the archive renamed to their public names.

use super::checksum::{sha256_file, write_checksum_file};
use super::{ArchiveName, ArtifactKind, Manifest, MANIFEST_FILE};
use crate::{BackupError, Result};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Prefix of per-run staging directories inside a backup directory.
pub const STAGING_PREFIX: &str = ".staging-";

/// An artifact produced by the snapshot step, waiting in staging.
#[derive(Debug, Clone)]
pub struct StagedArtifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
}

/// A published, immutable archive.
#[derive(Debug, Clone)]
pub struct SealedArchive {
    pub name: ArchiveName,
    pub path: PathBuf,
    pub checksum_path: PathBuf,
    pub checksum: String,
    pub size_bytes: u64,
    pub manifest: Manifest,
}

/// Build `name` from `artifacts` inside `staging` and publish it into `dest_dir`.
///
/// `staging` must live on the same filesystem as `dest_dir` so that
/// publication is a rename.
pub fn seal(
    staging: &Path,
    dest_dir: &Path,
    name: &ArchiveName,
    host: &str,
    artifacts: &[StagedArtifact],
    compression_level: i32,
) -> Result<SealedArchive> {
    let final_path = dest_dir.join(name.file_name());
    let final_checksum_path = dest_dir.join(name.checksum_file_name());
    if final_path.exists() || final_checksum_path.exists() {
        return Err(BackupError::Archive(format!(
            "{} already exists; refusing to overwrite a sealed archive",
            final_path.display()
        )));
    }

    let mut sized = Vec::with_capacity(artifacts.len());
    for artifact in artifacts {
        let size = std::fs::metadata(&artifact.path)?.len();
        sized.push((artifact.kind, size));
    }
    let manifest = Manifest::new(name.kind, name.created_at, host, sized);

    let manifest_path = staging.join(MANIFEST_FILE);
    std::fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest)?)?;

    let partial_path = staging.join(format!("{}.partial", name.file_name()));
    write_archive(&partial_path, &manifest_path, artifacts, compression_level)?;

    let checksum = sha256_file(&partial_path)?;
    let staged_checksum = staging.join(name.checksum_file_name());
    write_checksum_file(&staged_checksum, &checksum, &name.file_name())?;
    debug!(archive = %name, %checksum, "Archive built in staging");

    // Checksum first: an orphan checksum is harmless, an unchecked archive is not
    std::fs::rename(&staged_checksum, &final_checksum_path)?;
    if let Err(e) = std::fs::rename(&partial_path, &final_path) {
        let _ = std::fs::remove_file(&final_checksum_path);
        return Err(e.into());
    }

    let size_bytes = std::fs::metadata(&final_path)?.len();
    info!(archive = %final_path.display(), size_bytes, "Archive sealed");

    Ok(SealedArchive {
        name: name.clone(),
        path: final_path,
        checksum_path: final_checksum_path,
        checksum,
        size_bytes,
        manifest,
    })
}

fn write_archive(
    path: &Path,
    manifest_path: &Path,
    artifacts: &[StagedArtifact],
    compression_level: i32,
) -> Result<()> {
    let file = File::create(path)?;
    let encoder = zstd::stream::write::Encoder::new(BufWriter::new(file), compression_level)
        .map_err(|e| BackupError::Archive(format!("zstd init failed: {}", e)))?;

    let mut builder = tar::Builder::new(encoder);
    builder.append_path_with_name(manifest_path, MANIFEST_FILE)?;
    for artifact in artifacts {
        builder.append_path_with_name(&artifact.path, artifact.kind.file_name())?;
    }

    let encoder = builder.into_inner()?;
    let writer = encoder.finish()?;
    let file = writer
        .into_inner()
        .map_err(|e| BackupError::Io(e.into_error()))?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{reader, BackupKind, Verification};
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn staged(dir: &Path, kind: ArtifactKind, content: &[u8]) -> StagedArtifact {
        let path = dir.join(kind.file_name());
        std::fs::write(&path, content).unwrap();
        StagedArtifact { kind, path }
    }

    #[test]
    fn test_seal_publishes_archive_and_checksum() -> Result<()> {
        let dest = TempDir::new()?;
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(dest.path())?;
        let artifacts = vec![
            staged(staging.path(), ArtifactKind::Database, b"CREATE TABLE t (id int);"),
            staged(staging.path(), ArtifactKind::Config, b"POSTGRES_USER=app\n"),
        ];
        let name = ArchiveName::new(
            BackupKind::Database,
            Utc.with_ymd_and_hms(2026, 10, 18, 3, 0, 0).unwrap(),
        );

        let sealed = seal(staging.path(), dest.path(), &name, "host-a", &artifacts, 3)?;

        assert!(sealed.path.exists());
        assert!(sealed.checksum_path.exists());
        assert!(sealed.manifest.has(ArtifactKind::Database));
        assert!(!sealed.manifest.has(ArtifactKind::Cache));
        assert!(matches!(reader::verify(&sealed.path)?, Verification::Valid { .. }));

        // Nothing but the two public files and the staging dir
        let public: Vec<_> = std::fs::read_dir(dest.path())?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| !n.starts_with(STAGING_PREFIX))
            .collect();
        assert_eq!(public.len(), 2);
        Ok(())
    }

    #[test]
    fn test_seal_failure_leaves_nothing_public() -> Result<()> {
        let dest = TempDir::new()?;
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(dest.path())?;
        let artifacts = vec![StagedArtifact {
            kind: ArtifactKind::Database,
            path: staging.path().join("does-not-exist.sql"),
        }];
        let name = ArchiveName::new(BackupKind::Full, Utc::now());

        assert!(seal(staging.path(), dest.path(), &name, "host-a", &artifacts, 3).is_err());
        drop(staging);

        let leftovers: Vec<_> = std::fs::read_dir(dest.path())?.collect();
        assert!(leftovers.is_empty());
        Ok(())
    }

    #[test]
    fn test_seal_refuses_to_overwrite() -> Result<()> {
        let dest = TempDir::new()?;
        let staging = TempDir::new_in(dest.path())?;
        let name = ArchiveName::new(BackupKind::Files, Utc::now());
        std::fs::write(dest.path().join(name.file_name()), b"existing")?;

        let err = seal(staging.path(), dest.path(), &name, "host-a", &[], 3).unwrap_err();
        assert!(matches!(err, BackupError::Archive(_)));
        Ok(())
    }
}
