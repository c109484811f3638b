//! Point-in-time artifacts from the running services.
//!
//! A database failure aborts the run. Cache, vector store and config problems
//! are reported per artifact and the run carries on.

use crate::archive::{ArtifactKind, StagedArtifact};
use crate::config::{BackupConfig, StackConfig};
use crate::credentials::LiveCredentials;
use crate::stack::{ExecRequest, Stack};
use crate::utils::format::format_bytes;
use crate::{BackupError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub enum SnapshotOutcome {
    Produced(StagedArtifact),
    /// Nothing to capture (e.g. no env file); not a problem
    NotApplicable(String),
    /// Expected but not captured in time
    Skipped(String),
    Failed(String),
}

/// Timing and size limits for snapshotting.
#[derive(Debug, Clone)]
pub struct SnapshotSettings {
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
    pub cache_save_wait: Duration,
    pub cache_poll_interval: Duration,
    pub min_vector_store_bytes: u64,
}

impl From<&BackupConfig> for SnapshotSettings {
    fn from(config: &BackupConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            operation_timeout: config.operation_timeout(),
            cache_save_wait: Duration::from_secs(config.cache_save_wait_secs),
            cache_poll_interval: Duration::from_secs(config.cache_poll_interval_secs),
            min_vector_store_bytes: config.min_vector_store_bytes,
        }
    }
}

pub struct SnapshotProducer {
    stack: Arc<dyn Stack>,
    services: StackConfig,
    settings: SnapshotSettings,
    env_file: PathBuf,
}

impl SnapshotProducer {
    pub fn new(
        stack: Arc<dyn Stack>,
        services: StackConfig,
        settings: SnapshotSettings,
        env_file: PathBuf,
    ) -> Self {
        Self {
            stack,
            services,
            settings,
            env_file,
        }
    }

    /// Capture one artifact into `staging`.
    ///
    /// Only database problems come back as `Err`.
    pub async fn produce(
        &self,
        kind: ArtifactKind,
        staging: &Path,
        credentials: &LiveCredentials,
    ) -> Result<SnapshotOutcome> {
        let target = staging.join(kind.file_name());
        let outcome = match kind {
            ArtifactKind::Database => self.database(&target, credentials).await?,
            ArtifactKind::Cache => self.cache(&target, credentials).await,
            ArtifactKind::VectorStore => self.vector_store(&target).await,
            ArtifactKind::Config => self.config(&target).await,
        };

        match &outcome {
            SnapshotOutcome::Produced(artifact) => {
                let size = std::fs::metadata(&artifact.path).map(|m| m.len()).unwrap_or(0);
                info!(artifact = %kind, size = %format_bytes(size), "Artifact captured");
            }
            SnapshotOutcome::NotApplicable(reason) => info!(artifact = %kind, %reason, "Artifact not applicable"),
            SnapshotOutcome::Skipped(reason) => warn!(artifact = %kind, %reason, "Artifact skipped"),
            SnapshotOutcome::Failed(reason) => warn!(artifact = %kind, %reason, "Artifact failed"),
        }
        Ok(outcome)
    }

    async fn database(&self, target: &Path, credentials: &LiveCredentials) -> Result<SnapshotOutcome> {
        let service = &self.services.database_service;
        let db = credentials.require_database()?;

        let probe = ExecRequest::new(
            service,
            [
                "pg_isready".to_string(),
                "-U".to_string(),
                db.user.clone(),
                "-d".to_string(),
                db.name.clone(),
                "-t".to_string(),
                self.settings.connect_timeout.as_secs().max(1).to_string(),
            ],
        )
        .timeout(self.settings.connect_timeout + Duration::from_secs(5));

        match self.stack.exec(probe).await {
            Ok(output) if output.success() => {}
            Ok(output) => {
                return Err(BackupError::service_unavailable(service, output.failure_reason()))
            }
            Err(e) => return Err(BackupError::service_unavailable(service, e.to_string())),
        }

        let dump = ExecRequest::new(
            service,
            [
                "pg_dump".to_string(),
                "-U".to_string(),
                db.user.clone(),
                "-d".to_string(),
                db.name.clone(),
                "--no-owner".to_string(),
                "--no-privileges".to_string(),
            ],
        )
        .env("PGPASSWORD", &db.password)
        .stdout(target)
        .timeout(self.settings.operation_timeout);

        match self.stack.exec(dump).await {
            Ok(output) if output.success() => Ok(SnapshotOutcome::Produced(StagedArtifact {
                kind: ArtifactKind::Database,
                path: target.to_path_buf(),
            })),
            Ok(output) => Err(BackupError::Snapshot(format!(
                "pg_dump {}",
                output.failure_reason()
            ))),
            Err(e) => Err(BackupError::Snapshot(format!("pg_dump: {}", e))),
        }
    }

    fn redis_cli(&self, credentials: &LiveCredentials, command: &str) -> ExecRequest {
        let request = ExecRequest::new(&self.services.cache_service, ["redis-cli", command])
            .timeout(self.settings.connect_timeout);
        match &credentials.cache_password {
            Some(password) => request.env("REDISCLI_AUTH", password),
            None => request,
        }
    }

    async fn redis_reply(&self, credentials: &LiveCredentials, command: &str) -> std::result::Result<String, String> {
        match self.stack.exec(self.redis_cli(credentials, command)).await {
            Ok(output) if output.success() => Ok(output.stdout.trim().to_string()),
            Ok(output) => Err(format!("{} {}", command, output.failure_reason())),
            Err(e) => Err(format!("{}: {}", command, e)),
        }
    }

    async fn last_save(&self, credentials: &LiveCredentials) -> std::result::Result<i64, String> {
        let reply = self.redis_reply(credentials, "LASTSAVE").await?;
        reply
            .parse::<i64>()
            .map_err(|_| format!("unexpected LASTSAVE reply: {}", reply))
    }

    async fn cache(&self, target: &Path, credentials: &LiveCredentials) -> SnapshotOutcome {
        match self.redis_reply(credentials, "PING").await {
            Ok(reply) if reply == "PONG" => {}
            Ok(reply) => return SnapshotOutcome::Failed(format!("cache not reachable: {}", reply)),
            Err(reason) => return SnapshotOutcome::Failed(format!("cache not reachable: {}", reason)),
        }

        let before = match self.last_save(credentials).await {
            Ok(ts) => ts,
            Err(reason) => return SnapshotOutcome::Failed(reason),
        };
        if let Err(reason) = self.redis_reply(credentials, "BGSAVE").await {
            return SnapshotOutcome::Failed(reason);
        }

        let deadline = Instant::now() + self.settings.cache_save_wait;
        loop {
            tokio::time::sleep(self.settings.cache_poll_interval).await;
            match self.last_save(credentials).await {
                Ok(ts) if ts > before => break,
                Ok(_) => {}
                Err(reason) => return SnapshotOutcome::Failed(reason),
            }
            if Instant::now() >= deadline {
                return SnapshotOutcome::Skipped(format!(
                    "background save did not complete within {}s",
                    self.settings.cache_save_wait.as_secs()
                ));
            }
        }
        debug!("Cache background save completed");

        match self
            .stack
            .copy_from(
                &self.services.cache_service,
                &self.services.cache_dump_path,
                target,
                self.settings.operation_timeout,
            )
            .await
        {
            Ok(()) => SnapshotOutcome::Produced(StagedArtifact {
                kind: ArtifactKind::Cache,
                path: target.to_path_buf(),
            }),
            Err(e) => SnapshotOutcome::Failed(format!("cannot copy dump file: {}", e)),
        }
    }

    async fn vector_store(&self, target: &Path) -> SnapshotOutcome {
        let service = &self.services.vector_store_service;
        let dir = Path::new(&self.services.vector_store_dir);
        let (Some(parent), Some(base)) = (dir.parent(), dir.file_name()) else {
            return SnapshotOutcome::Failed(format!("invalid storage directory {}", dir.display()));
        };

        let probe = ExecRequest::new(service, ["test", "-d", self.services.vector_store_dir.as_str()])
            .timeout(self.settings.connect_timeout);
        match self.stack.exec(probe).await {
            Ok(output) if output.success() => {}
            Ok(_) => {
                return SnapshotOutcome::Failed(format!(
                    "storage directory {} not found",
                    dir.display()
                ))
            }
            Err(e) => return SnapshotOutcome::Failed(format!("vector store not reachable: {}", e)),
        }

        let archive = ExecRequest::new(
            service,
            [
                "tar".to_string(),
                "czf".to_string(),
                "-".to_string(),
                "-C".to_string(),
                parent.to_string_lossy().to_string(),
                base.to_string_lossy().to_string(),
            ],
        )
        .stdout(target)
        .timeout(self.settings.operation_timeout);

        let failure = match self.stack.exec(archive).await {
            Ok(output) if output.success() => None,
            Ok(output) => Some(format!("tar {}", output.failure_reason())),
            Err(e) => Some(e.to_string()),
        };
        if let Some(reason) = failure {
            let _ = std::fs::remove_file(target);
            return SnapshotOutcome::Failed(reason);
        }

        let size = std::fs::metadata(target).map(|m| m.len()).unwrap_or(0);
        if size < self.settings.min_vector_store_bytes {
            let _ = std::fs::remove_file(target);
            return SnapshotOutcome::Failed(format!(
                "payload is only {} (minimum {})",
                format_bytes(size),
                format_bytes(self.settings.min_vector_store_bytes)
            ));
        }

        SnapshotOutcome::Produced(StagedArtifact {
            kind: ArtifactKind::VectorStore,
            path: target.to_path_buf(),
        })
    }

    async fn config(&self, target: &Path) -> SnapshotOutcome {
        if !self.env_file.is_file() {
            return SnapshotOutcome::NotApplicable(format!(
                "{} not found",
                self.env_file.display()
            ));
        }
        match tokio::fs::copy(&self.env_file, target).await {
            Ok(_) => SnapshotOutcome::Produced(StagedArtifact {
                kind: ArtifactKind::Config,
                path: target.to_path_buf(),
            }),
            Err(e) => SnapshotOutcome::Failed(format!("cannot copy {}: {}", self.env_file.display(), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{credentials, fast_settings, FakeStack};
    use tempfile::TempDir;

    fn producer(stack: Arc<FakeStack>, env_file: PathBuf) -> SnapshotProducer {
        SnapshotProducer::new(stack, StackConfig::default(), fast_settings(), env_file)
    }

    #[tokio::test]
    async fn test_database_dump_written_to_staging() {
        let staging = TempDir::new().unwrap();
        let stack = Arc::new(FakeStack::healthy());
        let outcome = producer(stack.clone(), PathBuf::from("/nonexistent/.env"))
            .produce(ArtifactKind::Database, staging.path(), &credentials())
            .await
            .unwrap();

        let SnapshotOutcome::Produced(artifact) = outcome else {
            panic!("expected a database artifact");
        };
        let dump = std::fs::read_to_string(artifact.path).unwrap();
        assert!(dump.contains("INSERT INTO notes"));
        // Password travels in the environment
        assert!(stack
            .env_seen("pg_dump")
            .contains(&("PGPASSWORD".to_string(), "live-secret".to_string())));
    }

    #[tokio::test]
    async fn test_unreachable_database_is_fatal() {
        let staging = TempDir::new().unwrap();
        let stack = Arc::new(FakeStack::healthy().with_database_down());
        let err = producer(stack, PathBuf::from("/nonexistent/.env"))
            .produce(ArtifactKind::Database, staging.path(), &credentials())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::ServiceUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_cache_save_timeout_is_skipped() {
        let staging = TempDir::new().unwrap();
        let stack = Arc::new(FakeStack::healthy().with_cache_save_stuck());
        let outcome = producer(stack, PathBuf::from("/nonexistent/.env"))
            .produce(ArtifactKind::Cache, staging.path(), &credentials())
            .await
            .unwrap();
        assert!(matches!(outcome, SnapshotOutcome::Skipped(_)));
        assert!(!staging.path().join("cache.rdb").exists());
    }

    #[tokio::test]
    async fn test_cache_copied_after_save() {
        let staging = TempDir::new().unwrap();
        let stack = Arc::new(FakeStack::healthy());
        let outcome = producer(stack, PathBuf::from("/nonexistent/.env"))
            .produce(ArtifactKind::Cache, staging.path(), &credentials())
            .await
            .unwrap();
        assert!(matches!(outcome, SnapshotOutcome::Produced(_)));
        assert_eq!(
            std::fs::read(staging.path().join("cache.rdb")).unwrap(),
            b"REDIS0011-fake"
        );
    }

    #[tokio::test]
    async fn test_small_vector_store_payload_fails() {
        let staging = TempDir::new().unwrap();
        let stack = Arc::new(FakeStack::healthy().with_vector_payload(vec![0u8; 10]));
        let outcome = producer(stack, PathBuf::from("/nonexistent/.env"))
            .produce(ArtifactKind::VectorStore, staging.path(), &credentials())
            .await
            .unwrap();
        assert!(matches!(outcome, SnapshotOutcome::Failed(_)));
        assert!(!staging.path().join("vector-store.tar.gz").exists());
    }

    #[tokio::test]
    async fn test_config_copied_or_not_applicable() {
        let staging = TempDir::new().unwrap();
        let env = staging.path().join("stack.env");
        std::fs::write(&env, "POSTGRES_USER=app\n").unwrap();
        let stack = Arc::new(FakeStack::healthy());

        let outcome = producer(stack.clone(), env)
            .produce(ArtifactKind::Config, staging.path(), &credentials())
            .await
            .unwrap();
        assert!(matches!(outcome, SnapshotOutcome::Produced(_)));

        let outcome = producer(stack, staging.path().join("missing.env"))
            .produce(ArtifactKind::Config, staging.path(), &credentials())
            .await
            .unwrap();
        assert!(matches!(outcome, SnapshotOutcome::NotApplicable(_)));
    }
}
