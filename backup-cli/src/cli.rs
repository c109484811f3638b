//! Command line definition.

use backup_manager::archive::BackupKind;
use backup_manager::restore::RestoreScope;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "stack-backup", version, about = "Back up and restore a docker compose stack")]
pub struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "STACK_BACKUP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level or filter, overrides the configuration file
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Take a backup
    Backup {
        #[arg(value_enum)]
        kind: KindArg,

        /// Store the archive with the scheduled backups
        #[arg(long)]
        scheduled: bool,
    },

    /// Restore from an archive
    Restore(RestoreArgs),

    /// List archives
    List {
        /// List the remote instead of local archives
        #[arg(long)]
        remote: bool,

        /// Machine-readable output
        #[arg(long)]
        json: bool,
    },

    /// Check an archive's checksum and manifest
    Verify {
        /// `latest`, `remote:<file>`, a file name or a path
        source: String,

        /// Print the manifest as JSON
        #[arg(long)]
        json: bool,
    },

    /// Apply retention now
    Cleanup,

    /// Manage the crontab entry for scheduled backups
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
}

#[derive(Debug, Args)]
pub struct RestoreArgs {
    #[arg(value_enum)]
    pub scope: ScopeArg,

    /// `latest`, `remote:<file>`, a file name or a path
    pub source: String,

    /// Do not ask for confirmation
    #[arg(short, long)]
    pub yes: bool,

    /// Restore even if the checksum does not match
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, Subcommand)]
pub enum ScheduleAction {
    /// Install or replace the entry
    Install {
        /// Five-field cron expression or macro, e.g. "0 3 * * *"
        #[arg(long)]
        cron: String,

        #[arg(long, value_enum, default_value_t = KindArg::Full)]
        kind: KindArg,
    },
    /// Remove the entry
    Remove,
    /// Show the installed entry
    Show,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    Full,
    Database,
    Files,
}

impl From<KindArg> for BackupKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Full => BackupKind::Full,
            KindArg::Database => BackupKind::Database,
            KindArg::Files => BackupKind::Files,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ScopeArg {
    Full,
    Database,
    Files,
}

impl From<ScopeArg> for RestoreScope {
    fn from(scope: ScopeArg) -> Self {
        match scope {
            ScopeArg::Full => RestoreScope::Full,
            ScopeArg::Database => RestoreScope::Database,
            ScopeArg::Files => RestoreScope::Files,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_restore() {
        let cli = Cli::try_parse_from([
            "stack-backup",
            "--config",
            "/etc/sb.toml",
            "restore",
            "database",
            "latest",
            "--yes",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/sb.toml")));
        let Command::Restore(args) = cli.command else {
            panic!("expected restore");
        };
        assert_eq!(args.scope, ScopeArg::Database);
        assert_eq!(args.source, "latest");
        assert!(args.yes);
        assert!(!args.force);
    }

    #[test]
    fn test_parse_scheduled_backup() {
        let cli = Cli::try_parse_from(["stack-backup", "backup", "files", "--scheduled"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Backup {
                kind: KindArg::Files,
                scheduled: true
            }
        ));
    }

    #[test]
    fn test_rejects_unknown_kind() {
        assert!(Cli::try_parse_from(["stack-backup", "backup", "everything"]).is_err());
    }
}
