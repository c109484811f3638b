//! Subcommand handlers. Each returns the process exit code.

use crate::cli::{Command, RestoreArgs, ScheduleAction};
use anyhow::{Context, Result};
use backup_manager::archive::BackupKind;
use backup_manager::catalog::{BackupSource, Origin};
use backup_manager::health::HttpHealthProbe;
use backup_manager::manager::BackupManager;
use backup_manager::restore::{RestoreOptions, RestoreOrchestrator};
use backup_manager::retention::SystemClock;
use backup_manager::schedule::{Crontab, ScheduleEntry};
use backup_manager::stack::compose::ComposeStack;
use backup_manager::stack::Stack;
use backup_manager::transport::{self, RemoteStore};
use backup_manager::utils::format::{format_age, format_bytes};
use backup_manager::{archive::ArchiveName, Config};
use chrono::Utc;
use serde_json::json;
use std::io::{BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct App {
    pub config: Config,
    pub config_path: Option<PathBuf>,
}

impl App {
    fn stack(&self) -> Result<Arc<dyn Stack>> {
        let stack = ComposeStack::new(&self.config.stack, self.config.backup.operation_timeout())?;
        Ok(Arc::new(stack))
    }

    fn remote(&self) -> Result<Option<Arc<dyn RemoteStore>>> {
        Ok(self
            .config
            .remote
            .as_ref()
            .map(transport::from_config)
            .transpose()?)
    }

    fn manager(&self) -> Result<BackupManager> {
        Ok(BackupManager::new(
            self.config.clone(),
            self.stack()?,
            self.remote()?,
            Arc::new(SystemClock),
        ))
    }
}

pub async fn dispatch(app: &App, command: Command) -> Result<i32> {
    match command {
        Command::Backup { kind, scheduled } => {
            let origin = if scheduled { Origin::Scheduled } else { Origin::Manual };
            backup(app, kind.into(), origin).await
        }
        Command::Restore(args) => restore(app, args).await,
        Command::List { remote, json } => {
            if remote {
                list_remote(app, json).await
            } else {
                list_local(app, json)
            }
        }
        Command::Verify { source, json } => verify(app, &source, json).await,
        Command::Cleanup => {
            let summary = app.manager()?.cleanup().await?;
            println!("{}", summary);
            Ok(summary.exit_code())
        }
        Command::Schedule { action } => schedule(app, action).await,
    }
}

async fn backup(app: &App, kind: BackupKind, origin: Origin) -> Result<i32> {
    let summary = app.manager()?.run_backup(kind, origin).await?;
    println!("{}", summary);
    if let Some(error) = summary.error() {
        eprintln!("error: {}", error);
    }
    Ok(summary.exit_code())
}

async fn restore(app: &App, args: RestoreArgs) -> Result<i32> {
    let options = RestoreOptions {
        scope: args.scope.into(),
        source: BackupSource::parse(&args.source),
        assume_yes: args.yes,
        force: args.force,
    };
    let health = HttpHealthProbe::new(
        &app.config.stack.health_url,
        app.config.backup.connect_timeout(),
    )?;
    let orchestrator = RestoreOrchestrator::new(
        app.config.clone(),
        app.stack()?,
        app.remote()?,
        Arc::new(health),
    );

    let report = orchestrator.run(&options, &ask_operator).await?;
    println!("{}", report.summary);
    if let Some(error) = report.error() {
        eprintln!("error: {}", error);
    }
    Ok(report.summary.exit_code())
}

/// Interactive yes/no on the controlling terminal. Without one the answer is no.
fn ask_operator(prompt: &str) -> bool {
    let stdin = std::io::stdin();
    if !stdin.is_terminal() {
        eprintln!("{} [not a terminal, answering no; pass --yes to approve]", prompt);
        return false;
    }

    eprint!("{} [y/N] ", prompt);
    let _ = std::io::stderr().flush();
    let mut answer = String::new();
    match stdin.lock().read_line(&mut answer) {
        Ok(_) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
        Err(_) => false,
    }
}

fn list_local(app: &App, as_json: bool) -> Result<i32> {
    let archives = app.manager()?.list_local()?;
    let now = Utc::now();

    if as_json {
        let items: Vec<_> = archives
            .iter()
            .map(|a| {
                json!({
                    "name": a.name.file_name(),
                    "path": a.path,
                    "origin": a.origin.dir_name(),
                    "kind": a.name.kind.as_str(),
                    "created_at": a.name.created_at,
                    "size_bytes": a.size_bytes,
                    "has_checksum": a.has_checksum,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(0);
    }

    if archives.is_empty() {
        println!("No local archives in {}", app.config.backup.root_dir.display());
        return Ok(0);
    }
    println!("{:<44} {:<10} {:>12} {:>10}  CHECKSUM", "NAME", "ORIGIN", "SIZE", "AGE");
    for archive in &archives {
        println!(
            "{:<44} {:<10} {:>12} {:>10}  {}",
            archive.name.file_name(),
            archive.origin.dir_name(),
            format_bytes(archive.size_bytes),
            format_age(now - archive.name.created_at),
            if archive.has_checksum { "yes" } else { "MISSING" }
        );
    }
    Ok(0)
}

async fn list_remote(app: &App, as_json: bool) -> Result<i32> {
    let manager = app.manager()?;
    let entries = manager.list_remote().await?;
    let now = Utc::now();

    if as_json {
        let items: Vec<_> = entries
            .iter()
            .map(|e| {
                json!({
                    "name": e.file_name,
                    "created_at": ArchiveName::parse(&e.file_name).map(|n| n.created_at),
                    "size_bytes": e.size_bytes,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(0);
    }

    if entries.is_empty() {
        println!("No remote archives");
        return Ok(0);
    }
    println!("{:<44} {:>12} {:>10}", "NAME", "SIZE", "AGE");
    for entry in &entries {
        let age = ArchiveName::parse(&entry.file_name)
            .map(|n| format_age(now - n.created_at))
            .unwrap_or_default();
        println!(
            "{:<44} {:>12} {:>10}",
            entry.file_name,
            entry.size_bytes.map(format_bytes).unwrap_or_else(|| "-".to_string()),
            age
        );
    }
    Ok(0)
}

async fn verify(app: &App, source: &str, as_json: bool) -> Result<i32> {
    let report = app.manager()?.verify(&BackupSource::parse(source)).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report.manifest)?);
        return Ok(0);
    }

    let manifest = &report.manifest;
    println!("{}: OK", report.archive.display());
    println!("  sha256:  {}", report.checksum);
    println!("  kind:    {}", manifest.kind);
    println!("  created: {} on {}", manifest.created_at.to_rfc3339(), manifest.host);
    for artifact in &manifest.artifacts {
        println!("  {:<13} {}", artifact.kind.as_str(), artifact.size_human);
    }
    Ok(0)
}

async fn schedule(app: &App, action: ScheduleAction) -> Result<i32> {
    let crontab = Crontab::default();
    match action {
        ScheduleAction::Install { cron, kind } => {
            let binary = std::env::current_exe().context("cannot locate the stack-backup binary")?;
            let config = app
                .config_path
                .as_deref()
                .map(absolute)
                .transpose()?;
            let entry = ScheduleEntry::new(&cron, kind.into(), binary, config)?;
            let line = crontab.install(&entry).await?;
            println!("Installed: {}", line);
        }
        ScheduleAction::Remove => {
            if crontab.remove().await? {
                println!("Scheduled backup removed");
            } else {
                println!("No scheduled backup installed");
            }
        }
        ScheduleAction::Show => match crontab.show().await? {
            Some(line) => println!("{}", line),
            None => println!("No scheduled backup installed"),
        },
    }
    Ok(0)
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::fs::canonicalize(path).with_context(|| format!("cannot resolve {}", path.display()))
}
