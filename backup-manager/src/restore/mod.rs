//! Restore orchestration.
//!
//! A restore walks a fixed sequence of steps:
//!
//! ```text
//! Located -> Verified -> Extracted -> CredentialsLoaded -> ServicesQuiesced
//!         -> DatabaseReplaced -> FilesReplaced -> ServicesRestored -> done
//! ```
//!
//! A failing step stops the run where it is. Nothing is rolled back and
//! stopped services stay stopped, so an operator can inspect the state.
//! Credentials are always read from the live env file, never from the archive.

pub mod plan;

use crate::archive::{self, ArtifactKind, ExtractedArchive, Verification};
use crate::catalog::{self, BackupSource, Catalog, RESTORE_SCRATCH_PREFIX};
use crate::config::Config;
use crate::credentials::{DatabaseCredentials, LiveCredentials};
use crate::health::{wait_until_healthy, HealthProbe};
use crate::lock::RunLock;
use crate::stack::{ExecRequest, Stack};
use crate::summary::{Outcome, RunSummary};
use crate::transport::RemoteStore;
use crate::{BackupError, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub use plan::{plan_restore, RestorePlan, RestoreScope};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RestoreStep {
    Located,
    Verified,
    Extracted,
    CredentialsLoaded,
    ServicesQuiesced,
    DatabaseReplaced,
    FilesReplaced,
    ServicesRestored,
}

impl RestoreStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreStep::Located => "located",
            RestoreStep::Verified => "verified",
            RestoreStep::Extracted => "extracted",
            RestoreStep::CredentialsLoaded => "credentials-loaded",
            RestoreStep::ServicesQuiesced => "services-quiesced",
            RestoreStep::DatabaseReplaced => "database-replaced",
            RestoreStep::FilesReplaced => "files-replaced",
            RestoreStep::ServicesRestored => "services-restored",
        }
    }
}

impl fmt::Display for RestoreStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Asks the operator to approve a risky or destructive action.
pub trait Confirm: Send + Sync {
    fn confirm(&self, prompt: &str) -> bool;
}

impl<F> Confirm for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn confirm(&self, prompt: &str) -> bool {
        self(prompt)
    }
}

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    pub scope: RestoreScope,
    pub source: BackupSource,
    /// Approve every prompt (non-interactive runs)
    pub assume_yes: bool,
    /// Proceed even if the checksum does not match
    pub force: bool,
}

/// What a restore did. Fields stay `None` for steps that were never reached.
#[derive(Debug)]
pub struct RestoreReport {
    pub archive: Option<PathBuf>,
    pub verification: Option<Verification>,
    pub plan: Option<RestorePlan>,
    pub summary: RunSummary,
}

impl RestoreReport {
    /// The error that stopped the restore, if any.
    pub fn error(&self) -> Option<&BackupError> {
        self.summary.error()
    }
}

pub struct RestoreOrchestrator {
    config: Config,
    stack: Arc<dyn Stack>,
    remote: Option<Arc<dyn RemoteStore>>,
    health: Arc<dyn HealthProbe>,
}

/// Attach the failing step to an error. Configuration problems and
/// integrity refusals keep their class.
fn at<T>(step: RestoreStep, result: Result<T>) -> Result<T> {
    result.map_err(|e| match e {
        BackupError::Configuration(_)
        | BackupError::Integrity(_)
        | BackupError::Interrupted
        | BackupError::RestoreStep { .. } => e,
        other => {
            error!(%step, "Restore step failed: {}", other);
            BackupError::RestoreStep {
                step,
                reason: other.to_string(),
            }
        }
    })
}

impl RestoreOrchestrator {
    pub fn new(
        config: Config,
        stack: Arc<dyn Stack>,
        remote: Option<Arc<dyn RemoteStore>>,
        health: Arc<dyn HealthProbe>,
    ) -> Self {
        Self {
            config,
            stack,
            remote,
            health,
        }
    }

    /// Run every step in order.
    ///
    /// Only problems before the first step (lock, scratch space) come back as
    /// `Err`. A failing step ends the run and is recorded in the report's
    /// summary together with everything that completed before it.
    pub async fn run(&self, options: &RestoreOptions, confirm: &dyn Confirm) -> Result<RestoreReport> {
        let root = &self.config.backup.root_dir;
        let lock = RunLock::acquire(root, "restore", self.config.backup.lock_max_age())?;
        if let Err(e) = Catalog::new(root).sweep_staging() {
            warn!("Cannot sweep scratch directories: {}", e);
        }
        let scratch = tempfile::Builder::new()
            .prefix(RESTORE_SCRATCH_PREFIX)
            .tempdir_in(root)?;
        info!(
            run_id = %lock.lease().run_id,
            source = %options.source,
            scope = %options.scope,
            "Starting restore"
        );

        let mut report = RestoreReport {
            archive: None,
            verification: None,
            plan: None,
            summary: RunSummary::new(format!("restore {}", options.scope)),
        };

        if let Err(e) = self.run_steps(options, confirm, scratch.path(), &mut report).await {
            error!("Restore failed: {}", e);
            if let BackupError::RestoreStep { step, reason } = &e {
                report.summary.failed(step.as_str(), reason.clone());
            }
            let restarted = matches!(
                &e,
                BackupError::RestoreStep {
                    step: RestoreStep::ServicesRestored,
                    ..
                }
            );
            if !restarted && report.summary.entry(RestoreStep::ServicesQuiesced.as_str()).is_some() {
                report.summary.failed(
                    "services",
                    format!(
                        "left stopped: {}; start them once the cause is fixed",
                        self.config.stack.app_services.join(", ")
                    ),
                );
            }
            report.summary.fail(e);
        } else if let Some(archive) = &report.archive {
            info!(archive = %archive.display(), "Restore complete");
        }

        report.summary.finish();
        Ok(report)
    }

    async fn run_steps(
        &self,
        options: &RestoreOptions,
        confirm: &dyn Confirm,
        scratch: &Path,
        report: &mut RestoreReport,
    ) -> Result<()> {
        let catalog = Catalog::new(&self.config.backup.root_dir);
        let summary = &mut report.summary;

        // Located
        let archive = at(
            RestoreStep::Located,
            catalog::locate(&options.source, &catalog, self.remote.as_deref(), scratch).await,
        )?;
        summary.archive = Some(archive.clone());
        report.archive = Some(archive.clone());
        self.step_done(summary, RestoreStep::Located, archive.display().to_string());

        // Verified
        let verification = at(RestoreStep::Verified, self.verify(&archive, options, confirm).await)?;
        let verified_detail = match &verification {
            Verification::Valid { .. } => Outcome::Ok("checksum valid".into()),
            Verification::Missing { .. } => {
                Outcome::SkippedWithWarning("no checksum file; continued after confirmation".into())
            }
            Verification::Mismatch { .. } => {
                Outcome::SkippedWithWarning("checksum mismatch; continued with --force".into())
            }
        };
        summary.record(RestoreStep::Verified.as_str(), verified_detail);
        report.verification = Some(verification);
        info!(step = %RestoreStep::Verified, "Restore step complete");

        // Extracted
        let extracted = at(RestoreStep::Extracted, self.extract(&archive, scratch).await)?;
        self.step_done(
            summary,
            RestoreStep::Extracted,
            format!("{} artifact(s)", extracted.manifest.artifacts.len()),
        );

        // CredentialsLoaded
        let plan = at(
            RestoreStep::CredentialsLoaded,
            self.load_plan(&extracted, options, confirm),
        )?;
        self.step_done(summary, RestoreStep::CredentialsLoaded, "live env file");
        for (kind, reason) in &plan.skipped {
            summary.skipped(kind.as_str(), reason.clone());
        }
        let plan = report.plan.insert(plan);

        // ServicesQuiesced
        at(RestoreStep::ServicesQuiesced, self.quiesce(plan).await)?;
        self.step_done(
            summary,
            RestoreStep::ServicesQuiesced,
            self.config.stack.app_services.join(", "),
        );

        // DatabaseReplaced
        if let Some(db) = &plan.database {
            let result = match extracted.artifact_path(ArtifactKind::Database) {
                Some(dump) => self.replace_database(&dump, db).await,
                None => Err(BackupError::Archive("database artifact missing".into())),
            };
            at(RestoreStep::DatabaseReplaced, result)?;
            summary.ok(ArtifactKind::Database.as_str(), format!("restored into {}", db.name));
        }
        info!(step = %RestoreStep::DatabaseReplaced, "Restore step complete");

        // FilesReplaced
        at(
            RestoreStep::FilesReplaced,
            self.replace_files(plan, &extracted, summary).await,
        )?;
        info!(step = %RestoreStep::FilesReplaced, "Restore step complete");

        // ServicesRestored
        at(RestoreStep::ServicesRestored, self.bring_up().await)?;
        self.step_done(summary, RestoreStep::ServicesRestored, self.health.target());
        Ok(())
    }

    fn step_done(&self, summary: &mut RunSummary, step: RestoreStep, detail: impl Into<String>) {
        info!(%step, "Restore step complete");
        summary.ok(step.as_str(), detail);
    }

    async fn verify(
        &self,
        archive: &Path,
        options: &RestoreOptions,
        confirm: &dyn Confirm,
    ) -> Result<Verification> {
        let path = archive.to_path_buf();
        let verification = tokio::task::spawn_blocking(move || archive::verify(&path)).await??;

        match &verification {
            Verification::Valid { .. } => {}
            Verification::Missing { .. } => {
                let approved = options.assume_yes
                    || confirm.confirm(&format!(
                        "{} has no checksum file and cannot be verified. Restore it anyway?",
                        archive.display()
                    ));
                if !approved {
                    return Err(BackupError::Integrity(format!(
                        "{} has no checksum file; restore not confirmed",
                        archive.display()
                    )));
                }
                warn!(archive = %archive.display(), "Restoring an unverified archive");
            }
            Verification::Mismatch { expected, actual } => {
                if !options.force {
                    return Err(BackupError::Integrity(format!(
                        "checksum mismatch for {} (expected {}, got {}); use --force to restore anyway",
                        archive.display(),
                        expected,
                        actual
                    )));
                }
                warn!(archive = %archive.display(), "Restoring despite checksum mismatch (--force)");
            }
        }

        Ok(verification)
    }

    async fn extract(&self, archive: &Path, scratch: &Path) -> Result<ExtractedArchive> {
        let archive = archive.to_path_buf();
        let dest = scratch.join("extracted");
        tokio::task::spawn_blocking(move || archive::extract(&archive, &dest)).await?
    }

    fn load_plan(
        &self,
        extracted: &ExtractedArchive,
        options: &RestoreOptions,
        confirm: &dyn Confirm,
    ) -> Result<RestorePlan> {
        let credentials = LiveCredentials::load(&self.config.env_file())?;
        let plan = plan_restore(&extracted.manifest, &credentials, options.scope)?;

        if plan.is_empty() {
            return Err(BackupError::Archive(format!(
                "archive contains nothing to restore for scope {}",
                options.scope
            )));
        }

        let targets: Vec<&str> = ArtifactKind::ALL
            .iter()
            .filter(|k| plan.restores(**k))
            .map(ArtifactKind::as_str)
            .collect();
        let approved = options.assume_yes
            || confirm.confirm(&format!(
                "This replaces the current {} and stops {}. Continue?",
                targets.join(", "),
                self.config.stack.app_services.join(", ")
            ));
        if !approved {
            return Err(BackupError::Configuration("restore aborted by operator".into()));
        }

        Ok(plan)
    }

    async fn run_checked(&self, request: ExecRequest) -> Result<()> {
        let program = request.program().to_string();
        let output = self.stack.exec(request).await?;
        if output.success() {
            Ok(())
        } else {
            Err(BackupError::Command(format!("{} {}", program, output.failure_reason())))
        }
    }

    async fn quiesce(&self, plan: &RestorePlan) -> Result<()> {
        let stack = &self.config.stack;
        if !stack.app_services.is_empty() {
            self.stack.stop(&stack.app_services).await?;
        }

        let mut data_services = Vec::new();
        if plan.database.is_some() {
            data_services.push(stack.database_service.clone());
        }
        if plan.vector_store {
            data_services.push(stack.vector_store_service.clone());
        }
        if !data_services.is_empty() {
            self.stack.start(&data_services).await?;
        }

        if let Some(db) = &plan.database {
            let connect = self.config.backup.connect_timeout();
            let probe = ExecRequest::new(
                &stack.database_service,
                [
                    "pg_isready".to_string(),
                    "-U".to_string(),
                    db.user.clone(),
                    "-t".to_string(),
                    connect.as_secs().max(1).to_string(),
                ],
            )
            .timeout(connect + Duration::from_secs(5));
            self.run_checked(probe)
                .await
                .map_err(|e| BackupError::service_unavailable(&stack.database_service, e.to_string()))?;
        }
        Ok(())
    }

    fn psql(&self, db: &DatabaseCredentials, database: &str) -> ExecRequest {
        ExecRequest::new(
            &self.config.stack.database_service,
            [
                "psql".to_string(),
                "-U".to_string(),
                db.user.clone(),
                "-d".to_string(),
                database.to_string(),
                "-v".to_string(),
                "ON_ERROR_STOP=1".to_string(),
                "-q".to_string(),
            ],
        )
        .env("PGPASSWORD", &db.password)
        .timeout(self.config.backup.operation_timeout())
    }

    async fn replace_database(&self, dump: &Path, db: &DatabaseCredentials) -> Result<()> {
        let statements = [
            format!(
                "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
                 WHERE datname = {} AND pid <> pg_backend_pid();",
                quote_literal(&db.name)
            ),
            format!("DROP DATABASE IF EXISTS {};", quote_ident(&db.name)),
            format!(
                "CREATE DATABASE {} OWNER {};",
                quote_ident(&db.name),
                quote_ident(&db.user)
            ),
        ];

        for sql in statements {
            let mut request = self.psql(db, "postgres");
            request.args.push("-c".to_string());
            request.args.push(sql);
            self.run_checked(request).await?;
        }

        info!(database = %db.name, "Importing database dump");
        self.run_checked(self.psql(db, &db.name).stdin(dump)).await
    }

    async fn replace_files(
        &self,
        plan: &RestorePlan,
        extracted: &ExtractedArchive,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let stack = &self.config.stack;
        let timeout = self.config.backup.operation_timeout();

        if plan.vector_store {
            let payload = extracted
                .artifact_path(ArtifactKind::VectorStore)
                .ok_or_else(|| BackupError::Archive("vector-store artifact missing".into()))?;
            let dir = Path::new(&stack.vector_store_dir);
            let parent = dir
                .parent()
                .ok_or_else(|| BackupError::Configuration(format!("invalid storage directory {}", dir.display())))?;

            // Clear contents rather than the directory itself, which may be a mount point
            let script = r#"find "$1" -mindepth 1 -delete && tar xzf - -C "$2" && chown -R "$3" "$1""#;
            let request = ExecRequest::new(
                &stack.vector_store_service,
                [
                    "sh".to_string(),
                    "-c".to_string(),
                    script.to_string(),
                    "sh".to_string(),
                    stack.vector_store_dir.clone(),
                    parent.to_string_lossy().to_string(),
                    stack.vector_store_owner.clone(),
                ],
            )
            .stdin(&payload)
            .timeout(timeout);
            self.run_checked(request).await?;

            let service = [stack.vector_store_service.clone()];
            self.stack.stop(&service).await?;
            self.stack.start(&service).await?;
            summary.ok(ArtifactKind::VectorStore.as_str(), "storage replaced");
        }

        if plan.cache {
            let dump = extracted
                .artifact_path(ArtifactKind::Cache)
                .ok_or_else(|| BackupError::Archive("cache artifact missing".into()))?;
            let service = [stack.cache_service.clone()];
            // Stopped first so a shutdown save cannot overwrite the restored file
            self.stack.stop(&service).await?;
            self.stack
                .copy_to(&stack.cache_service, &dump, &stack.cache_dump_path, timeout)
                .await?;
            self.stack.start(&service).await?;
            summary.ok(ArtifactKind::Cache.as_str(), "dump file replaced");
        }

        Ok(())
    }

    async fn bring_up(&self) -> Result<()> {
        self.stack.up_all().await?;
        wait_until_healthy(
            self.health.as_ref(),
            self.config.stack.health_attempts,
            Duration::from_secs(self.config.stack.health_interval_secs),
        )
        .await?;
        Ok(())
    }
}

fn quote_ident(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
