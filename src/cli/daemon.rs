//! The `run-daemon` command

use anyhow::{Context, Result};
use istota_core::scheduler::InstanceLock;
use istota_core::store::Store;
use istota_core::{Channels, Config, Scheduler};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub async fn run(config: Config) -> Result<()> {
    let mut lock = InstanceLock::new(config.daemon.lock_path.clone())?;
    let _guard = lock
        .try_acquire()
        .context("Another istota instance is already running on this host")?;

    let store = Arc::new(Store::open(&config.daemon.db_path).context("Failed to open database")?);
    let config = Arc::new(config);
    let mut scheduler = Scheduler::new(store, config, Channels::disabled());

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        signal_shutdown.cancel();
    });

    println!("istota daemon started (PID: {})", std::process::id());
    scheduler.run(shutdown).await?;
    println!("istota daemon stopped.");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
