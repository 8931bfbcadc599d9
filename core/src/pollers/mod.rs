//! Periodic producers driven by the scheduler loop
//!
//! Each poller advances only through its own persisted cursor, so replaying
//! a tick with an unchanged cursor is a no-op. Inbound pollers turn new
//! upstream events into tasks; maintenance pollers expire, sweep and alert.

pub mod briefing;
pub mod chat;
pub mod cleanup;
pub mod email;
pub mod file_tasks;
pub mod heartbeat;
pub mod scheduled;
pub mod shared_files;
pub mod sleep_cycle;

use crate::channels::Channels;
use crate::config::Config;
use crate::error::Result;
use crate::store::Store;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Everything a poller sees during one tick.
#[derive(Clone)]
pub struct PollerCtx {
    pub store: Arc<Store>,
    pub config: Arc<Config>,
    pub channels: Channels,
    pub now: DateTime<Utc>,
}

#[async_trait]
pub trait Poller: Send + Sync {
    fn name(&self) -> &'static str;

    /// How often the scheduler loop invokes this poller.
    fn cadence(&self) -> Duration;

    async fn tick(&self, ctx: &PollerCtx) -> Result<()>;
}

/// The standard poller set, in tick order.
pub fn standard_pollers() -> Vec<Box<dyn Poller>> {
    vec![
        Box::new(chat::ChatPoller),
        Box::new(email::EmailPoller),
        Box::new(file_tasks::FileTasksPoller),
        Box::new(shared_files::SharedFilesPoller),
        Box::new(briefing::BriefingPoller),
        Box::new(scheduled::ScheduledJobPoller),
        Box::new(sleep_cycle::SleepCyclePoller),
        Box::new(heartbeat::HeartbeatPoller),
        Box::new(cleanup::CleanupPoller),
    ]
}
