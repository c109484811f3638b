//! stack-backup - command line entry point
//!
//! Exit codes follow the failure class: 0 success, 2 configuration,
//! 3 service unavailable, 4 integrity, 5 transfer, 6 restore step,
//! 7 another run in progress, 8 completed with warnings, 130 interrupted.

mod cli;
mod commands;
mod shutdown;

use backup_manager::{utils, BackupError, Config};
use clap::Parser;
use cli::Cli;
use commands::App;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = run(cli).await;
    std::process::exit(code);
}

async fn run(cli: Cli) -> i32 {
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return e.exit_code();
        }
    };

    let log_level = cli.log_level.as_deref().unwrap_or(&config.log.level);
    if let Err(e) = utils::logger::init(log_level, Some(&config.log_file())) {
        // Keep going with stderr only; the operation itself is unaffected
        eprintln!("warning: cannot open log file {}: {}", config.log_file().display(), e);
        let _ = utils::logger::init(log_level, None);
    }

    tracing::debug!(
        "stack-backup v{} starting (root: {})",
        env!("CARGO_PKG_VERSION"),
        config.backup.root_dir.display()
    );

    let app = App {
        config,
        config_path: cli.config,
    };

    tokio::select! {
        result = commands::dispatch(&app, cli.command) => match result {
            Ok(code) => code,
            Err(e) => {
                tracing::error!("{:#}", e);
                eprintln!("error: {:#}", e);
                e.downcast_ref::<BackupError>().map_or(1, BackupError::exit_code)
            }
        },
        signal = shutdown::wait_for_signal() => {
            tracing::warn!("Received {}, abandoning the current run", signal);
            eprintln!("interrupted ({})", signal);
            BackupError::Interrupted.exit_code()
        }
    }
}
