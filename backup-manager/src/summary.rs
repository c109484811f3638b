//! Per-run summary: one line per component plus an overall status.

use crate::utils::format::format_duration;
use crate::BackupError;
use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ok(String),
    /// Not applicable to this run; not a problem
    Skipped(String),
    /// Expected but not produced because of a non-fatal problem
    SkippedWithWarning(String),
    Failed(String),
}

impl Outcome {
    pub fn is_warning(&self) -> bool {
        matches!(self, Outcome::SkippedWithWarning(_) | Outcome::Failed(_))
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Ok(detail) if detail.is_empty() => write!(f, "ok"),
            Outcome::Ok(detail) => write!(f, "ok ({})", detail),
            Outcome::Skipped(reason) => write!(f, "skipped ({})", reason),
            Outcome::SkippedWithWarning(reason) => write!(f, "skipped ({}) [warning]", reason),
            Outcome::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryEntry {
    pub component: String,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    CompletedWithWarnings,
    /// Archive sealed locally but the off-host copy failed
    Degraded,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunStatus::Success => "success",
            RunStatus::CompletedWithWarnings => "completed with warnings",
            RunStatus::Degraded => "degraded (local copy only)",
            RunStatus::Failed => "failed",
        })
    }
}

/// Component name used for the off-host transfer line.
pub const TRANSFER: &str = "transfer";

#[derive(Debug)]
pub struct RunSummary {
    pub operation: String,
    pub archive: Option<PathBuf>,
    entries: Vec<SummaryEntry>,
    fatal: Option<BackupError>,
    started: Instant,
    finished: Option<std::time::Duration>,
}

impl RunSummary {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            archive: None,
            entries: Vec::new(),
            fatal: None,
            started: Instant::now(),
            finished: None,
        }
    }

    pub fn record(&mut self, component: impl Into<String>, outcome: Outcome) {
        self.entries.push(SummaryEntry {
            component: component.into(),
            outcome,
        });
    }

    pub fn ok(&mut self, component: impl Into<String>, detail: impl Into<String>) {
        self.record(component, Outcome::Ok(detail.into()));
    }

    pub fn skipped(&mut self, component: impl Into<String>, reason: impl Into<String>) {
        self.record(component, Outcome::Skipped(reason.into()));
    }

    pub fn failed(&mut self, component: impl Into<String>, reason: impl Into<String>) {
        self.record(component, Outcome::Failed(reason.into()));
    }

    /// Mark the whole run as failed. The first fatal error wins.
    pub fn fail(&mut self, error: BackupError) {
        if self.fatal.is_none() {
            self.fatal = Some(error);
        }
    }

    pub fn finish(&mut self) {
        self.finished = Some(self.started.elapsed());
    }

    pub fn entries(&self) -> &[SummaryEntry] {
        &self.entries
    }

    pub fn entry(&self, component: &str) -> Option<&Outcome> {
        self.entries
            .iter()
            .find(|e| e.component == component)
            .map(|e| &e.outcome)
    }

    pub fn error(&self) -> Option<&BackupError> {
        self.fatal.as_ref()
    }

    pub fn status(&self) -> RunStatus {
        if self.fatal.is_some() {
            RunStatus::Failed
        } else if matches!(self.entry(TRANSFER), Some(Outcome::Failed(_))) {
            RunStatus::Degraded
        } else if self.entries.iter().any(|e| e.outcome.is_warning()) {
            RunStatus::CompletedWithWarnings
        } else {
            RunStatus::Success
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self.status() {
            RunStatus::Success => 0,
            RunStatus::CompletedWithWarnings => 8,
            RunStatus::Degraded => BackupError::Transfer(String::new()).exit_code(),
            RunStatus::Failed => self.fatal.as_ref().map_or(1, BackupError::exit_code),
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let elapsed = self.finished.unwrap_or_else(|| self.started.elapsed());
        writeln!(
            f,
            "{} finished: {} ({})",
            self.operation,
            self.status(),
            format_duration(elapsed.as_secs())
        )?;
        if let Some(archive) = &self.archive {
            writeln!(f, "  archive: {}", archive.display())?;
        }
        for entry in &self.entries {
            writeln!(f, "  {}: {}", entry.component, entry.outcome)?;
        }
        if let Some(error) = &self.fatal {
            writeln!(f, "  error: {}", error)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_precedence() {
        let mut summary = RunSummary::new("backup full");
        summary.ok("database", "1.00 MB");
        summary.skipped("config", "env file not found");
        assert_eq!(summary.status(), RunStatus::Success);
        assert_eq!(summary.exit_code(), 0);

        summary.record("cache", Outcome::SkippedWithWarning("save timed out".into()));
        assert_eq!(summary.status(), RunStatus::CompletedWithWarnings);
        assert_eq!(summary.exit_code(), 8);

        summary.failed(TRANSFER, "connection refused");
        assert_eq!(summary.status(), RunStatus::Degraded);
        assert_eq!(summary.exit_code(), 5);

        summary.fail(BackupError::service_unavailable("postgres", "refused"));
        assert_eq!(summary.status(), RunStatus::Failed);
        assert_eq!(summary.exit_code(), 3);
    }

    #[test]
    fn test_display_lists_components() {
        let mut summary = RunSummary::new("backup full");
        summary.ok("database", "2.00 KB");
        summary.record("cache", Outcome::SkippedWithWarning("save did not complete".into()));
        summary.finish();

        let text = summary.to_string();
        assert!(text.starts_with("backup full finished: completed with warnings"));
        assert!(text.contains("  database: ok (2.00 KB)"));
        assert!(text.contains("  cache: skipped (save did not complete) [warning]"));
    }
}
