//! Backup archive format.
//!
//! An archive is a zstd-compressed tar holding `manifest.json` plus zero or
//! more artifact files, published next to a sha256sum-style checksum file:
//!
//! ```text
//! backup_full_20261018_030000.tar.zst
//! backup_full_20261018_030000.tar.zst.sha256
//! ```

pub mod builder;
pub mod checksum;
pub mod reader;

use crate::utils::format::format_bytes;
use crate::{BackupError, Result};
use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use builder::{seal, SealedArchive, StagedArtifact, STAGING_PREFIX};
pub use reader::{extract, read_manifest, verify, ExtractedArchive, Verification};

pub const ARCHIVE_EXTENSION: &str = ".tar.zst";
pub const CHECKSUM_EXTENSION: &str = ".sha256";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const FORMAT_VERSION: u32 = 1;

const NAME_PREFIX: &str = "backup_";
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// What a backup run captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Full,
    Database,
    Files,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Database => "database",
            BackupKind::Files => "files",
        }
    }

    /// Artifact kinds a run of this kind attempts to produce, in archive order.
    pub fn artifact_kinds(&self) -> &'static [ArtifactKind] {
        match self {
            BackupKind::Full => &[
                ArtifactKind::Database,
                ArtifactKind::Cache,
                ArtifactKind::VectorStore,
                ArtifactKind::Config,
            ],
            BackupKind::Database => &[ArtifactKind::Database, ArtifactKind::Config],
            BackupKind::Files => &[
                ArtifactKind::Cache,
                ArtifactKind::VectorStore,
                ArtifactKind::Config,
            ],
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupKind {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(BackupKind::Full),
            "database" => Ok(BackupKind::Database),
            "files" => Ok(BackupKind::Files),
            other => Err(BackupError::Archive(format!("unknown backup kind: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    Database,
    Cache,
    VectorStore,
    Config,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 4] = [
        ArtifactKind::Database,
        ArtifactKind::Cache,
        ArtifactKind::VectorStore,
        ArtifactKind::Config,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Database => "database",
            ArtifactKind::Cache => "cache",
            ArtifactKind::VectorStore => "vector-store",
            ArtifactKind::Config => "config",
        }
    }

    /// File name of the artifact inside the archive.
    pub fn file_name(&self) -> &'static str {
        match self {
            ArtifactKind::Database => "database.sql",
            ArtifactKind::Cache => "cache.rdb",
            ArtifactKind::VectorStore => "vector-store.tar.gz",
            ArtifactKind::Config => "config.env",
        }
    }

    pub fn from_file_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.file_name() == name)
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timestamp-derived archive identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArchiveName {
    pub kind: BackupKind,
    pub created_at: DateTime<Utc>,
}

impl ArchiveName {
    pub fn new(kind: BackupKind, created_at: DateTime<Utc>) -> Self {
        Self {
            kind,
            created_at: created_at.trunc_subsecs(0),
        }
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}{}_{}{}",
            NAME_PREFIX,
            self.kind,
            self.created_at.format(TIMESTAMP_FORMAT),
            ARCHIVE_EXTENSION
        )
    }

    pub fn checksum_file_name(&self) -> String {
        format!("{}{}", self.file_name(), CHECKSUM_EXTENSION)
    }

    /// Parse `backup_<kind>_<YYYYMMDD>_<HHMMSS>.tar.zst`.
    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name
            .strip_prefix(NAME_PREFIX)?
            .strip_suffix(ARCHIVE_EXTENSION)?;
        let (kind, timestamp) = stem.split_once('_')?;
        let kind = kind.parse().ok()?;
        let created_at = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT)
            .ok()?
            .and_utc();
        Some(Self { kind, created_at })
    }
}

impl fmt::Display for ArchiveName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

/// Presence flags, one per artifact kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Components {
    pub database: bool,
    pub cache: bool,
    pub vector_store: bool,
    pub config: bool,
}

impl Components {
    pub fn get(&self, kind: ArtifactKind) -> bool {
        match kind {
            ArtifactKind::Database => self.database,
            ArtifactKind::Cache => self.cache,
            ArtifactKind::VectorStore => self.vector_store,
            ArtifactKind::Config => self.config,
        }
    }

    fn set(&mut self, kind: ArtifactKind) {
        match kind {
            ArtifactKind::Database => self.database = true,
            ArtifactKind::Cache => self.cache = true,
            ArtifactKind::VectorStore => self.vector_store = true,
            ArtifactKind::Config => self.config = true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub kind: ArtifactKind,
    pub file_name: String,
    pub size_bytes: u64,
    pub size_human: String,
}

/// Archive metadata, serialized as `manifest.json` inside every archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    pub host: String,
    pub kind: BackupKind,
    pub components: Components,
    pub artifacts: Vec<ArtifactEntry>,
}

impl Manifest {
    pub fn new(
        kind: BackupKind,
        created_at: DateTime<Utc>,
        host: impl Into<String>,
        artifacts: Vec<(ArtifactKind, u64)>,
    ) -> Self {
        let mut components = Components::default();
        let artifacts = artifacts
            .into_iter()
            .map(|(kind, size_bytes)| {
                components.set(kind);
                ArtifactEntry {
                    kind,
                    file_name: kind.file_name().to_string(),
                    size_bytes,
                    size_human: format_bytes(size_bytes),
                }
            })
            .collect();

        Self {
            format_version: FORMAT_VERSION,
            created_at,
            host: host.into(),
            kind,
            components,
            artifacts,
        }
    }

    pub fn has(&self, kind: ArtifactKind) -> bool {
        self.components.get(kind)
    }

    pub fn artifact(&self, kind: ArtifactKind) -> Option<&ArtifactEntry> {
        self.artifacts.iter().find(|a| a.kind == kind)
    }

    /// Check the manifest against the file names physically in the archive.
    ///
    /// Flags, artifact list and archive entries must all agree.
    pub fn check_consistency(&self, entries: &[String]) -> Result<()> {
        if self.format_version > FORMAT_VERSION {
            return Err(BackupError::Archive(format!(
                "unsupported archive format version {} (this build reads up to {})",
                self.format_version, FORMAT_VERSION
            )));
        }

        for kind in ArtifactKind::ALL {
            let flagged = self.components.get(kind);
            let listed = self.artifact(kind).is_some();
            let present = entries.iter().any(|e| e == kind.file_name());

            if flagged != listed {
                return Err(BackupError::Archive(format!(
                    "manifest flag for {} disagrees with its artifact list",
                    kind
                )));
            }
            if listed && !present {
                return Err(BackupError::Archive(format!(
                    "manifest lists {} but {} is missing from the archive",
                    kind,
                    kind.file_name()
                )));
            }
            if present && !listed {
                return Err(BackupError::Archive(format!(
                    "archive contains {} which the manifest does not list",
                    kind.file_name()
                )));
            }
        }

        Ok(())
    }
}
