//! Backup Engine - Main entry point
//!
//! Runs one backup, restore, info or retention command and exits with the
//! OR of the failure categories raised during the run.

use anyhow::Result;
use backup_engine::catalog::parse_filter;
use backup_engine::executor::{self, BackupOptions, RestoreOptions};
use backup_engine::model::BackupKind;
use backup_engine::utils::{self, shutdown::ShutdownCoordinator, Failure};
use backup_engine::{Config, RunContext};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", default_value = "backup-engine.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Back up the selected databases and tables
    Backup {
        /// full, diff, incr or part
        #[arg(short = 't', long = "type", default_value = "full")]
        kind: BackupKind,

        /// Backup name (YYYYMMDD_HHMMSS plus the type letter)
        #[arg(short, long)]
        name: Option<String>,

        /// Only back up parts of this partition
        #[arg(short, long)]
        partition: Option<String>,

        /// `db` or `db.table`, repeatable
        #[arg(short, long, value_name = "DB[.TABLE]")]
        filter: Vec<String>,
    },
    /// Restore a backup into the catalog
    Restore {
        /// Backup to restore (newest when omitted)
        #[arg(short, long)]
        name: Option<String>,

        /// `db` or `db.table`, repeatable
        #[arg(short, long, value_name = "DB[.TABLE]")]
        filter: Vec<String>,
    },
    /// List stored backups
    Info,
    /// Delete broken backups and fulls beyond the kept count
    Retention {
        /// Full backups to keep (overrides config)
        #[arg(short, long)]
        keep: Option<usize>,
    },
    /// Print the version
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Command::Version = args.command {
        println!("backup-engine {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    // Load configuration
    let config = match Config::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit((Failure::Config.bit() | Failure::Run.bit()) as i32);
        }
    };

    // Initialize logging
    let log_level = args.log_level.clone().unwrap_or_else(|| config.log.level.clone());
    utils::logger::init(&log_level)?;

    tracing::info!("Starting backup-engine v{}", env!("CARGO_PKG_VERSION"));

    let shutdown = ShutdownCoordinator::new();
    shutdown.listen();

    let ctx = match RunContext::connect(config, shutdown.token()).await {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::error!("Cannot open storage: {}", e);
            std::process::exit(Failure::Run.bit() as i32);
        }
    };

    if let Err(e) = execute(&ctx, args.command).await {
        tracing::error!("Run failed: {}", e);
        ctx.fail(Failure::Run);
    }

    let raised = ctx.status.raised();
    if !raised.is_empty() {
        let names: Vec<String> = raised.iter().map(ToString::to_string).collect();
        tracing::warn!("Finished with failures: {}", names.join(", "));
    }
    std::process::exit(ctx.status.exit_code());
}

async fn execute(ctx: &RunContext, command: Command) -> backup_engine::Result<()> {
    match command {
        Command::Backup {
            kind,
            name,
            partition,
            filter,
        } => {
            let options = BackupOptions {
                kind,
                name,
                partition,
                filter: parse_filter(filter.as_slice()).inspect_err(|_| ctx.fail(Failure::Config))?,
            };
            executor::backup::run(ctx, options).await?;
        }
        Command::Restore { name, filter } => {
            let options = RestoreOptions {
                name,
                filter: parse_filter(filter.as_slice()).inspect_err(|_| ctx.fail(Failure::Config))?,
            };
            executor::restore::run(ctx, options).await?;
        }
        Command::Info => {
            for info in executor::info::run(ctx).await? {
                println!("{}", info.describe());
            }
        }
        Command::Retention { keep } => {
            let keep = keep.unwrap_or(ctx.config.retention.backup_full);
            let deleted = executor::retention::run(ctx, keep).await?;
            tracing::info!("Retention deleted {} backups", deleted.len());
        }
        Command::Version => {}
    }
    Ok(())
}
