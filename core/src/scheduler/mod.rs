//! The top-level scheduler loop
//!
//! One event-driven loop multiplexes every poller at its own cadence, then
//! lets the worker pool top itself up. Cadences are tracked as absolute
//! deadlines so a slow tick delays but never compounds drift.

pub mod lock;

pub use lock::InstanceLock;

use crate::channels::Channels;
use crate::config::Config;
use crate::delivery::DeliveryRouter;
use crate::effects::DeferredEffects;
use crate::error::Result;
use crate::executor::AgentExecutor;
use crate::pollers::{standard_pollers, Poller, PollerCtx};
use crate::pool::{TaskRunner, WorkerPool};
use crate::prompt::PromptBuilder;
use crate::store::{Store, TaskFilter, TaskStatus};
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

struct PollerEntry {
    poller: Box<dyn Poller>,
    next_due: Instant,
}

pub struct Scheduler {
    store: Arc<Store>,
    config: Arc<Config>,
    channels: Channels,
    runner: Arc<TaskRunner>,
    pool: Arc<WorkerPool>,
    pollers: Vec<PollerEntry>,
}

/// What a single `run-once` pass did.
#[derive(Debug, Default)]
pub struct RunOnceReport {
    pub executed: Vec<(i64, TaskStatus)>,
    pub would_run: Vec<i64>,
}

impl Scheduler {
    pub fn new(store: Arc<Store>, config: Arc<Config>, channels: Channels) -> Self {
        let executor = Arc::new(AgentExecutor::new(
            config.executor.clone(),
            config.daemon.scratch_dir.clone(),
            config.daemon.db_path.clone(),
            store.clone(),
        ));
        let runner = Arc::new(TaskRunner {
            store: store.clone(),
            config: config.clone(),
            executor,
            prompts: Arc::new(PromptBuilder::new(store.clone(), config.clone())),
            effects: Arc::new(DeferredEffects::new(store.clone(), config.clone())),
            router: Arc::new(DeliveryRouter::new(channels.clone(), store.clone(), config.clone())),
        });
        let pool = Arc::new(WorkerPool::new(runner.clone()));

        let now = Instant::now();
        let pollers = standard_pollers()
            .into_iter()
            .map(|poller| PollerEntry { poller, next_due: now })
            .collect();

        Self { store, config, channels, runner, pool, pollers }
    }

    fn poller_ctx(&self) -> PollerCtx {
        PollerCtx {
            store: self.store.clone(),
            config: self.config.clone(),
            channels: self.channels.clone(),
            now: Utc::now(),
        }
    }

    /// The daemon loop. Runs until `shutdown` fires, then stops accepting
    /// work and drains the pool.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        info!(poll_interval = self.config.daemon.poll_interval_secs, "scheduler started");
        let interval = Duration::from_secs(self.config.daemon.poll_interval_secs);

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            self.tick_due_pollers().await;

            if let Err(err) = self.pool.dispatch(Utc::now()) {
                error!(%err, "worker dispatch failed");
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        info!("scheduler stopping");
        self.pool.shutdown().await;
        Ok(())
    }

    async fn tick_due_pollers(&mut self) {
        let ctx = self.poller_ctx();
        for entry in &mut self.pollers {
            if Instant::now() < entry.next_due {
                continue;
            }
            entry.next_due = Instant::now() + entry.poller.cadence();
            if let Err(err) = entry.poller.tick(&ctx).await {
                warn!(poller = entry.poller.name(), %err, "poller tick failed");
            }
        }
    }

    /// Single pass: tick every poller once, then drain claimable tasks
    /// inline (no pool). With `dry_run` nothing executes; the report lists
    /// what would have.
    pub async fn run_once(&mut self, max_tasks: Option<u32>, dry_run: bool) -> Result<RunOnceReport> {
        let ctx = self.poller_ctx();
        for entry in &self.pollers {
            if let Err(err) = entry.poller.tick(&ctx).await {
                warn!(poller = entry.poller.name(), %err, "poller tick failed");
            }
        }

        let mut report = RunOnceReport::default();

        if dry_run {
            let now = Utc::now();
            let pending = self.store.list_tasks(&TaskFilter {
                status: Some(TaskStatus::Pending),
                ..Default::default()
            })?;
            report.would_run = pending
                .iter()
                .filter(|t| t.scheduled_for.is_none_or(|at| at <= now))
                .map(|t| t.id)
                .collect();
            return Ok(report);
        }

        let max_retry_age = ChronoDuration::hours(self.config.daemon.max_retry_age_hours as i64);
        let limit = max_tasks.unwrap_or(u32::MAX);
        while (report.executed.len() as u32) < limit {
            let Some(task) =
                self.store.claim_task("run-once", None, None, max_retry_age, Utc::now())?
            else {
                break;
            };
            let id = task.id;
            match self.runner.run(task).await {
                Ok(status) => report.executed.push((id, status)),
                Err(err) => {
                    error!(task_id = id, %err, "task pipeline error");
                    report.executed.push((id, TaskStatus::Failed));
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutorConfig;
    use crate::store::{NewTask, SourceType};
    use std::path::PathBuf;

    fn scratch() -> PathBuf {
        std::env::temp_dir().join(format!("istota-test-sched-{}", uuid::Uuid::new_v4()))
    }

    fn scheduler_with_script(script: &str) -> Scheduler {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let config = Arc::new(Config {
            executor: ExecutorConfig {
                program: "sh".into(),
                args: vec!["-c".into(), script.into()],
                api_retry_delay_secs: 0,
                ..Default::default()
            },
            daemon: crate::config::DaemonConfig {
                poll_interval_secs: 1,
                scratch_dir: scratch(),
                ..Default::default()
            },
            ..Default::default()
        });
        Scheduler::new(store, config, Channels::disabled())
    }

    // Seeded relative to wall time: run_once ticks the cleanup poller,
    // whose retention sweeps run against Utc::now().
    fn seed_at(scheduler: &Scheduler, prompt: &str, second: i64) -> i64 {
        let now = Utc::now() + ChronoDuration::seconds(second);
        scheduler
            .store
            .create_task(&NewTask::prompt("alice", SourceType::Cli, prompt), now)
            .unwrap()
    }

    fn seed(scheduler: &Scheduler, prompt: &str) -> i64 {
        seed_at(scheduler, prompt, 0)
    }

    #[tokio::test]
    async fn run_once_executes_pending_tasks_inline() {
        let mut scheduler =
            scheduler_with_script(r#"echo '{"type": "result", "result": "done"}'"#);
        let a = seed_at(&scheduler, "first", 0);
        let b = seed_at(&scheduler, "second", 1);

        let report = scheduler.run_once(None, false).await.unwrap();
        let executed: Vec<i64> = report.executed.iter().map(|(id, _)| *id).collect();
        assert_eq!(executed, vec![a, b]);
        assert!(report.executed.iter().all(|(_, status)| *status == TaskStatus::Completed));
    }

    #[tokio::test]
    async fn run_once_honors_max_tasks() {
        let mut scheduler =
            scheduler_with_script(r#"echo '{"type": "result", "result": "done"}'"#);
        seed_at(&scheduler, "first", 0);
        let b = seed_at(&scheduler, "second", 1);

        let report = scheduler.run_once(Some(1), false).await.unwrap();
        assert_eq!(report.executed.len(), 1);
        assert_eq!(
            scheduler.store.get_task(b).unwrap().unwrap().status,
            TaskStatus::Pending
        );
    }

    #[tokio::test]
    async fn dry_run_reports_without_executing() {
        let mut scheduler = scheduler_with_script("exit 1");
        let id = seed(&scheduler, "untouched");

        let report = scheduler.run_once(None, true).await.unwrap();
        assert_eq!(report.would_run, vec![id]);
        assert!(report.executed.is_empty());
        assert_eq!(
            scheduler.store.get_task(id).unwrap().unwrap().status,
            TaskStatus::Pending
        );
    }

    #[tokio::test]
    async fn daemon_loop_processes_work_and_stops_on_shutdown() {
        let mut scheduler =
            scheduler_with_script(r#"echo '{"type": "result", "result": "done"}'"#);
        let id = seed(&scheduler, "through the daemon");
        let store = scheduler.store.clone();

        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        let waiter = tokio::spawn(async move {
            for _ in 0..100 {
                let task = store.get_task(id).unwrap().unwrap();
                if task.status.is_terminal() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            trigger.cancel();
        });

        scheduler.run(shutdown).await.unwrap();
        waiter.await.unwrap();

        let task = scheduler.store.get_task(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.as_deref(), Some("done"));
    }
}
