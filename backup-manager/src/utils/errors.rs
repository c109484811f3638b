//! Custom error types for the backup manager.

use crate::restore::RestoreStep;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Service unavailable: {service}: {reason}")]
    ServiceUnavailable { service: String, reason: String },

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Restore failed at step {step}: {reason}")]
    RestoreStep { step: RestoreStep, reason: String },

    #[error("Another run is already in progress: {0}")]
    AlreadyRunning(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Command failed: {0}")]
    Command(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Interrupted")]
    Interrupted,
}

impl BackupError {
    pub fn service_unavailable(service: impl Into<String>, reason: impl Into<String>) -> Self {
        BackupError::ServiceUnavailable {
            service: service.into(),
            reason: reason.into(),
        }
    }

    /// Process exit code for this failure class.
    pub fn exit_code(&self) -> i32 {
        match self {
            BackupError::Configuration(_) => 2,
            BackupError::ServiceUnavailable { .. } => 3,
            BackupError::Integrity(_) => 4,
            BackupError::Transfer(_) => 5,
            BackupError::RestoreStep { .. } => 6,
            BackupError::AlreadyRunning(_) => 7,
            BackupError::Interrupted => 130,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct_per_class() {
        let codes = [
            BackupError::Configuration("x".into()).exit_code(),
            BackupError::service_unavailable("postgres", "down").exit_code(),
            BackupError::Integrity("x".into()).exit_code(),
            BackupError::Transfer("x".into()).exit_code(),
            BackupError::RestoreStep {
                step: RestoreStep::Verified,
                reason: "x".into(),
            }
            .exit_code(),
            BackupError::AlreadyRunning("x".into()).exit_code(),
        ];

        let mut sorted = codes.to_vec();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), codes.len());
        assert!(!codes.contains(&0));
    }

    #[test]
    fn test_restore_step_message_names_step() {
        let err = BackupError::RestoreStep {
            step: RestoreStep::DatabaseReplaced,
            reason: "psql exited with 3".into(),
        };
        assert_eq!(
            err.to_string(),
            "Restore failed at step database-replaced: psql exited with 3"
        );
    }
}
