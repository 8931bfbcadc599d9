//! CLI commands for istota

pub mod daemon;
pub mod once;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// istota - personal assistant task orchestrator
#[derive(Parser)]
#[command(name = "istota")]
#[command(about = "Personal-assistant task orchestrator")]
#[command(version)]
pub struct Cli {
    /// Path to istota.toml (defaults to the standard locations)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the long-running scheduler daemon
    RunDaemon,
    /// Tick every poller once and drain claimable tasks, then exit
    RunOnce {
        /// Stop after executing this many tasks
        #[arg(long)]
        max_tasks: Option<u32>,
        /// Report what would run without executing anything
        #[arg(long)]
        dry_run: bool,
    },
}
