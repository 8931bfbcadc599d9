//! The `run-once` command

use anyhow::{Context, Result};
use console::Style;
use istota_core::store::Store;
use istota_core::{Channels, Config, Scheduler};
use std::sync::Arc;

pub async fn run(config: Config, max_tasks: Option<u32>, dry_run: bool) -> Result<()> {
    let green = Style::new().green();
    let yellow = Style::new().yellow();

    let store = Arc::new(Store::open(&config.daemon.db_path).context("Failed to open database")?);
    let config = Arc::new(config);
    let mut scheduler = Scheduler::new(store, config, Channels::disabled());

    let report = scheduler.run_once(max_tasks, dry_run).await?;

    if dry_run {
        if report.would_run.is_empty() {
            println!("Nothing to do.");
        } else {
            println!("{} task(s) would run:", report.would_run.len());
            for id in &report.would_run {
                println!("  task {id}");
            }
        }
        return Ok(());
    }

    if report.executed.is_empty() {
        println!("Nothing to do.");
    } else {
        for (id, status) in &report.executed {
            println!("  task {} -> {}", id, green.apply_to(status));
        }
        println!(
            "{} task(s) processed.",
            yellow.apply_to(report.executed.len())
        );
    }
    Ok(())
}
