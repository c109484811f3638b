//! Detached sha256 checksums in `sha256sum` format.

use crate::{BackupError, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use super::CHECKSUM_EXTENSION;

/// Hex sha256 of a file's contents.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    std::io::copy(&mut reader, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Sibling checksum path for an archive.
pub fn checksum_path(archive: &Path) -> PathBuf {
    let mut name = archive.as_os_str().to_owned();
    name.push(CHECKSUM_EXTENSION);
    PathBuf::from(name)
}

/// Write `<digest>  <file name>\n` and flush it to disk.
pub fn write_checksum_file(path: &Path, digest: &str, file_name: &str) -> Result<()> {
    let mut file = File::create(path)?;
    writeln!(file, "{}  {}", digest, file_name)?;
    file.sync_all()?;
    Ok(())
}

/// Read the digest from a checksum file; `None` if the file does not exist.
pub fn read_checksum_file(path: &Path) -> Result<Option<String>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let digest = content.split_whitespace().next().unwrap_or_default();
    if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(BackupError::Integrity(format!(
            "malformed checksum file {}",
            path.display()
        )));
    }

    Ok(Some(digest.to_ascii_lowercase()))
}
