//! Reading sealed archives: integrity check, manifest, extraction.

use super::checksum::{checksum_path, read_checksum_file, sha256_file};
use super::{Manifest, MANIFEST_FILE};
use crate::{BackupError, Result};
use std::fs::File;
use std::io::BufReader;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Result of comparing an archive against its detached checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Valid { checksum: String },
    /// No checksum file next to the archive
    Missing { actual: String },
    Mismatch { expected: String, actual: String },
}

impl Verification {
    pub fn is_valid(&self) -> bool {
        matches!(self, Verification::Valid { .. })
    }
}

/// An archive unpacked into a private directory.
#[derive(Debug, Clone)]
pub struct ExtractedArchive {
    pub dir: PathBuf,
    pub manifest: Manifest,
}

impl ExtractedArchive {
    pub fn artifact_path(&self, kind: super::ArtifactKind) -> Option<PathBuf> {
        self.manifest
            .artifact(kind)
            .map(|entry| self.dir.join(&entry.file_name))
    }
}

/// Recompute the archive digest and compare it with the sibling checksum file.
pub fn verify(archive: &Path) -> Result<Verification> {
    if !archive.is_file() {
        return Err(BackupError::Archive(format!(
            "archive not found: {}",
            archive.display()
        )));
    }

    let actual = sha256_file(archive)?;
    let verification = match read_checksum_file(&checksum_path(archive))? {
        None => Verification::Missing { actual },
        Some(expected) if expected == actual => Verification::Valid { checksum: actual },
        Some(expected) => Verification::Mismatch { expected, actual },
    };

    match &verification {
        Verification::Valid { .. } => debug!(archive = %archive.display(), "Checksum valid"),
        Verification::Missing { .. } => {
            warn!(archive = %archive.display(), "Checksum file missing")
        }
        Verification::Mismatch { expected, actual } => warn!(
            archive = %archive.display(),
            %expected,
            %actual,
            "Checksum mismatch"
        ),
    }

    Ok(verification)
}

/// Read and check the manifest without unpacking artifacts to disk.
pub fn read_manifest(archive: &Path) -> Result<Manifest> {
    let mut tar = open(archive)?;
    let mut manifest = None;
    let mut names = Vec::new();

    for entry in tar.entries()? {
        let entry = entry?;
        let name = entry_name(&entry)?;
        if name == MANIFEST_FILE {
            manifest = Some(serde_json::from_reader::<_, Manifest>(entry)?);
        }
        names.push(name);
    }

    let manifest = manifest.ok_or_else(|| {
        BackupError::Archive(format!("{} has no {}", archive.display(), MANIFEST_FILE))
    })?;
    manifest.check_consistency(&names)?;
    Ok(manifest)
}

/// Unpack `archive` into `dest` and return its checked manifest.
pub fn extract(archive: &Path, dest: &Path) -> Result<ExtractedArchive> {
    std::fs::create_dir_all(dest)?;
    let mut tar = open(archive)?;
    let mut names = Vec::new();

    for entry in tar.entries()? {
        let mut entry = entry?;
        let name = entry_name(&entry)?;
        entry.unpack(dest.join(&name))?;
        names.push(name);
    }

    let manifest_path = dest.join(MANIFEST_FILE);
    if !manifest_path.is_file() {
        return Err(BackupError::Archive(format!(
            "{} has no {}",
            archive.display(),
            MANIFEST_FILE
        )));
    }
    let manifest: Manifest = serde_json::from_reader(BufReader::new(File::open(&manifest_path)?))?;
    manifest.check_consistency(&names)?;

    Ok(ExtractedArchive {
        dir: dest.to_path_buf(),
        manifest,
    })
}

fn open(archive: &Path) -> Result<tar::Archive<zstd::stream::read::Decoder<'static, BufReader<File>>>> {
    let file = File::open(archive)?;
    let decoder = zstd::stream::read::Decoder::new(file)
        .map_err(|e| BackupError::Archive(format!("{}: {}", archive.display(), e)))?;
    Ok(tar::Archive::new(decoder))
}

/// Archives are flat; anything with directories or `..` is rejected.
fn entry_name<R: std::io::Read>(entry: &tar::Entry<'_, R>) -> Result<String> {
    let path = entry.path()?;
    let mut components = path.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) => Ok(name.to_string_lossy().to_string()),
        _ => Err(BackupError::Archive(format!(
            "unexpected archive entry {}",
            path.display()
        ))),
    }
}
