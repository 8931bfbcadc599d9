//! `istota` - personal-assistant task orchestrator daemon
//!
//! This binary fronts the core scheduler: `run-daemon` starts the
//! long-running loop (one instance per host), `run-once` does a single
//! poll-and-drain pass for cron-driven or scripted setups.

use anyhow::{Context, Result};
use clap::Parser;

use crate::cli::{Cli, Commands};

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("istota=info,istota_core=info")),
        )
        .init();

    let config = istota_core::Config::load(cli.config.as_deref())
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::RunDaemon => cli::daemon::run(config).await,
        Commands::RunOnce { max_tasks, dry_run } => {
            cli::once::run(config, max_tasks, dry_run).await
        }
    }
}
