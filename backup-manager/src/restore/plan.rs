//! Deciding what a restore will do, before anything is touched.

use crate::archive::{ArtifactKind, Manifest};
use crate::credentials::{DatabaseCredentials, LiveCredentials};
use crate::{BackupError, Result};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreScope {
    Full,
    Database,
    /// Vector store and cache
    Files,
}

impl RestoreScope {
    pub fn includes(&self, kind: ArtifactKind) -> bool {
        match (self, kind) {
            (_, ArtifactKind::Config) => false,
            (RestoreScope::Full, _) => true,
            (RestoreScope::Database, ArtifactKind::Database) => true,
            (RestoreScope::Files, ArtifactKind::Cache | ArtifactKind::VectorStore) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreScope::Full => "full",
            RestoreScope::Database => "database",
            RestoreScope::Files => "files",
        }
    }
}

impl fmt::Display for RestoreScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RestoreScope {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(RestoreScope::Full),
            "database" => Ok(RestoreScope::Database),
            "files" => Ok(RestoreScope::Files),
            other => Err(BackupError::Configuration(format!(
                "unknown restore scope: {}",
                other
            ))),
        }
    }
}

/// The concrete work of one restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestorePlan {
    /// Identity the database is recreated under; always the live one
    pub database: Option<DatabaseCredentials>,
    pub vector_store: bool,
    pub cache: bool,
    /// Artifacts left alone, with the reason
    pub skipped: Vec<(ArtifactKind, String)>,
}

impl RestorePlan {
    pub fn is_empty(&self) -> bool {
        self.database.is_none() && !self.vector_store && !self.cache
    }

    pub fn restores(&self, kind: ArtifactKind) -> bool {
        match kind {
            ArtifactKind::Database => self.database.is_some(),
            ArtifactKind::VectorStore => self.vector_store,
            ArtifactKind::Cache => self.cache,
            ArtifactKind::Config => false,
        }
    }
}

/// Merge what the archive holds, the live credentials and the requested scope.
///
/// Pure: no I/O, no service access. Fails only when the database would be
/// restored but the live env file has no database credentials.
pub fn plan_restore(
    manifest: &Manifest,
    credentials: &LiveCredentials,
    scope: RestoreScope,
) -> Result<RestorePlan> {
    let mut plan = RestorePlan {
        database: None,
        vector_store: false,
        cache: false,
        skipped: Vec::new(),
    };

    for kind in ArtifactKind::ALL {
        let present = manifest.has(kind);
        if kind == ArtifactKind::Config {
            if present {
                plan.skipped
                    .push((kind, "live configuration is kept; archived copy is reference only".into()));
            }
            continue;
        }
        if !scope.includes(kind) {
            if present {
                plan.skipped.push((kind, format!("outside {} scope", scope)));
            }
            continue;
        }
        if !present {
            plan.skipped.push((kind, "not in archive".into()));
            continue;
        }

        match kind {
            ArtifactKind::Database => plan.database = Some(credentials.require_database()?.clone()),
            ArtifactKind::VectorStore => plan.vector_store = true,
            ArtifactKind::Cache => plan.cache = true,
            ArtifactKind::Config => {}
        }
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::BackupKind;
    use crate::testing::credentials;
    use chrono::Utc;

    fn manifest(kinds: &[ArtifactKind]) -> Manifest {
        Manifest::new(
            BackupKind::Full,
            Utc::now(),
            "host-a",
            kinds.iter().map(|k| (*k, 100)).collect(),
        )
    }

    #[test]
    fn test_full_scope_full_archive() {
        let plan = plan_restore(&manifest(&ArtifactKind::ALL), &credentials(), RestoreScope::Full).unwrap();
        assert!(plan.database.is_some());
        assert!(plan.vector_store);
        assert!(plan.cache);
        assert_eq!(plan.skipped.len(), 1);
        assert_eq!(plan.skipped[0].0, ArtifactKind::Config);
    }

    #[test]
    fn test_database_scope_never_touches_files() {
        let plan = plan_restore(&manifest(&ArtifactKind::ALL), &credentials(), RestoreScope::Database).unwrap();
        assert!(plan.database.is_some());
        assert!(!plan.restores(ArtifactKind::VectorStore));
        assert!(!plan.restores(ArtifactKind::Cache));
    }

    #[test]
    fn test_credentials_come_from_live_config() {
        let plan = plan_restore(
            &manifest(&[ArtifactKind::Database, ArtifactKind::Config]),
            &credentials(),
            RestoreScope::Full,
        )
        .unwrap();
        let db = plan.database.unwrap();
        assert_eq!(db.user, "app");
        assert_eq!(db.password, "live-secret");
    }

    #[test]
    fn test_files_scope_on_database_archive_is_empty() {
        let plan = plan_restore(
            &manifest(&[ArtifactKind::Database]),
            &credentials(),
            RestoreScope::Files,
        )
        .unwrap();
        assert!(plan.is_empty());
        assert!(plan
            .skipped
            .iter()
            .any(|(k, reason)| *k == ArtifactKind::VectorStore && reason == "not in archive"));
    }

    #[test]
    fn test_missing_database_credentials() {
        let mut creds = credentials();
        creds.database = None;

        let err = plan_restore(&manifest(&ArtifactKind::ALL), &creds, RestoreScope::Full).unwrap_err();
        assert!(matches!(err, BackupError::Configuration(_)));

        // Files never need them
        let plan = plan_restore(&manifest(&ArtifactKind::ALL), &creds, RestoreScope::Files).unwrap();
        assert!(plan.vector_store && plan.cache);
    }

    #[test]
    fn test_scope_parsing() {
        assert_eq!("files".parse::<RestoreScope>().unwrap(), RestoreScope::Files);
        assert!("everything".parse::<RestoreScope>().is_err());
    }
}
