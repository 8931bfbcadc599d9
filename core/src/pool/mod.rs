//! Two-tier worker pool with per-user caps
//!
//! Dispatch runs in two phases per scheduler tick, foreground then
//! background. A worker is a tokio task keyed `(user_id, queue, slot)`
//! that loops claiming work for its user until it idles out or shutdown is
//! requested. Pool bookkeeping lives in one mutex-guarded map.

use crate::config::Config;
use crate::delivery::DeliveryRouter;
use crate::effects::DeferredEffects;
use crate::error::{IstotaError, Result};
use crate::executor::{retry, AgentExecutor, ExecOutcome, ProgressFn};
use crate::prompt::PromptBuilder;
use crate::store::{Store, Task, TaskQueue, TaskStatus};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Delay between empty claims while a worker idles.
const CLAIM_BACKOFF_SECS: u64 = 1;

/// Runs one claimed task through the whole pipeline: prompt, subprocess,
/// terminal write, deferred effects, delivery. Shared by pool workers and
/// the run-once path.
pub struct TaskRunner {
    pub store: Arc<Store>,
    pub config: Arc<Config>,
    pub executor: Arc<AgentExecutor>,
    pub prompts: Arc<PromptBuilder>,
    pub effects: Arc<DeferredEffects>,
    pub router: Arc<DeliveryRouter>,
}

impl TaskRunner {
    /// Drive `task` (already claimed) to a terminal or parked state.
    pub async fn run(&self, task: Task) -> Result<TaskStatus> {
        let now = Utc::now();

        // Safe point: a cancel that raced the claim wins before we spawn.
        // The task may already be terminal if the cancel landed first.
        if task.cancel_requested || self.store.is_task_cancelled(task.id)? {
            match self.store.update_task_status(task.id, TaskStatus::Cancelled, None, None, None, now)
            {
                Ok(()) | Err(IstotaError::TerminalStatus { .. }) => {}
                Err(err) => return Err(err),
            }
            return Ok(TaskStatus::Cancelled);
        }

        self.store.mark_running(task.id, None, now)?;
        let task = self
            .store
            .get_task(task.id)?
            .ok_or(IstotaError::TaskNotFound(task.id))?;

        let prompt = match task.command {
            Some(_) => None,
            None => Some(self.prompts.build(&task, now)?),
        };

        let task_id = task.id;
        let progress: ProgressFn = Arc::new(move |event| {
            debug!(task_id, ?event, "task progress");
        });

        match self.executor.execute(&task, prompt.as_deref(), progress).await {
            Ok(ExecOutcome::Completed { result, actions }) => {
                let now = Utc::now();
                self.store.update_task_status(
                    task.id,
                    TaskStatus::Completed,
                    Some(&result),
                    None,
                    Some(&actions),
                    now,
                )?;

                // Effects apply after the terminal write and before the
                // result reaches any channel.
                let deferred = self.executor.deferred_dir(&task.user_id);
                if let Err(err) = self.effects.process(&task, &deferred, now).await {
                    warn!(task_id = task.id, %err, "deferred effects failed");
                }

                if let Some(job_id) = task.scheduled_job_id {
                    let _ = self.store.record_job_success(job_id, now);
                }

                self.router.deliver(&task, &result).await;
                Ok(TaskStatus::Completed)
            }

            Ok(ExecOutcome::ConfirmationNeeded { prompt }) => {
                let now = Utc::now();
                self.store.set_confirmation(task.id, &prompt, now)?;
                // The user has to see the question to answer it.
                self.router.deliver(&task, &prompt).await;
                Ok(TaskStatus::PendingConfirmation)
            }

            Ok(ExecOutcome::Cancelled) => {
                self.store.update_task_status(
                    task.id,
                    TaskStatus::Cancelled,
                    None,
                    None,
                    None,
                    Utc::now(),
                )?;
                Ok(TaskStatus::Cancelled)
            }

            Err(err) => self.handle_failure(task, err).await,
        }
    }

    async fn handle_failure(&self, task: Task, err: IstotaError) -> Result<TaskStatus> {
        let now = Utc::now();
        let current = self
            .store
            .get_task(task.id)?
            .ok_or(IstotaError::TaskNotFound(task.id))?;

        if matches!(err, IstotaError::Cancelled) {
            self.store.update_task_status(task.id, TaskStatus::Cancelled, None, None, None, now)?;
            return Ok(TaskStatus::Cancelled);
        }

        if current.can_retry() {
            let delay = retry::backoff_delay(
                &self.config.executor.retry_backoff_minutes,
                current.attempt_count,
            );
            info!(
                task_id = task.id,
                attempt = current.attempt_count,
                delay_minutes = delay.num_minutes(),
                %err,
                "task failed; scheduling retry"
            );
            self.store.set_pending_retry(task.id, &err.to_string(), delay, now)?;
            return Ok(TaskStatus::Pending);
        }

        error!(task_id = task.id, attempts = current.attempt_count, %err, "task failed permanently");
        self.store.update_task_status(
            task.id,
            TaskStatus::Failed,
            None,
            Some(&err.to_string()),
            None,
            now,
        )?;

        if let Some(job_id) = task.scheduled_job_id {
            match self.store.record_job_failure(
                job_id,
                &err.to_string(),
                self.config.daemon.job_disable_threshold,
            ) {
                Ok(true) => warn!(job_id, "scheduled job disabled after repeated failures"),
                Ok(false) => {}
                Err(store_err) => warn!(job_id, %store_err, "could not record job failure"),
            }
        }

        self.router.deliver(&task, &err.user_message()).await;
        Ok(TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WorkerKey {
    user_id: String,
    queue: TaskQueue,
    slot: u32,
}

pub struct WorkerPool {
    runner: Arc<TaskRunner>,
    workers: Mutex<HashMap<WorkerKey, JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn new(runner: Arc<TaskRunner>) -> Self {
        Self { runner, workers: Mutex::new(HashMap::new()), shutdown: CancellationToken::new() }
    }

    /// Two-phase dispatch: top up foreground workers, then background,
    /// within instance and per-user caps.
    pub fn dispatch(self: &Arc<Self>, now: DateTime<Utc>) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        self.prune_finished();

        for queue in [TaskQueue::Foreground, TaskQueue::Background] {
            let instance_cap = match queue {
                TaskQueue::Foreground => self.runner.config.workers.max_foreground_workers,
                TaskQueue::Background => self.runner.config.workers.max_background_workers,
            };

            for user_id in self.runner.store.list_users_with_pending(queue, now)? {
                let user_cap = match queue {
                    TaskQueue::Foreground => self.runner.config.user_foreground_cap(&user_id),
                    TaskQueue::Background => self.runner.config.user_background_cap(&user_id),
                };
                let pending = self.runner.store.count_pending(&user_id, queue, now)?;
                let desired = user_cap.min(pending);

                for slot in 0..desired {
                    if self.active_count(queue) >= instance_cap {
                        break;
                    }
                    let key = WorkerKey { user_id: user_id.clone(), queue, slot };
                    let mut workers = self.workers.lock();
                    if workers.contains_key(&key) {
                        continue;
                    }
                    let handle = self.spawn_worker(key.clone());
                    workers.insert(key, handle);
                }
            }
        }
        Ok(())
    }

    fn spawn_worker(self: &Arc<Self>, key: WorkerKey) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        debug!(user = %key.user_id, queue = %key.queue, slot = key.slot, "starting worker");
        tokio::spawn(async move {
            pool.worker_loop(&key).await;
            pool.workers.lock().remove(&key);
            debug!(user = %key.user_id, queue = %key.queue, slot = key.slot, "worker exited");
        })
    }

    async fn worker_loop(&self, key: &WorkerKey) {
        let worker_id = format!("worker-{}-{}-{}", key.user_id, key.queue, key.slot);
        let idle_timeout =
            Duration::from_secs(self.runner.config.workers.worker_idle_timeout_secs);
        let max_retry_age = ChronoDuration::hours(self.runner.config.daemon.max_retry_age_hours as i64);
        let mut idle_since = tokio::time::Instant::now();

        loop {
            if self.shutdown.is_cancelled() {
                return;
            }

            let claimed = self.runner.store.claim_task(
                &worker_id,
                Some(&key.user_id),
                Some(key.queue),
                max_retry_age,
                Utc::now(),
            );

            match claimed {
                Ok(Some(task)) => {
                    let task_id = task.id;
                    if let Err(err) = self.runner.run(task).await {
                        error!(task_id, %err, "task pipeline error");
                    }
                    idle_since = tokio::time::Instant::now();
                }
                Ok(None) => {
                    if idle_since.elapsed() >= idle_timeout {
                        return;
                    }
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_secs(CLAIM_BACKOFF_SECS)) => {}
                    }
                }
                Err(err) => {
                    warn!(%worker_id, %err, "claim failed");
                    tokio::time::sleep(Duration::from_secs(CLAIM_BACKOFF_SECS)).await;
                }
            }
        }
    }

    fn active_count(&self, queue: TaskQueue) -> u32 {
        self.workers.lock().keys().filter(|key| key.queue == queue).count() as u32
    }

    fn prune_finished(&self) {
        self.workers.lock().retain(|_, handle| !handle.is_finished());
    }

    /// How many workers are currently registered, across both queues.
    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Cooperative shutdown: flag, then join with a bounded timeout, then
    /// abort stragglers.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let grace = Duration::from_secs(self.runner.config.workers.shutdown_grace_secs);
        let handles: Vec<(WorkerKey, JoinHandle<()>)> =
            self.workers.lock().drain().collect();

        for (key, handle) in handles {
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!(user = %key.user_id, queue = %key.queue, slot = key.slot, "worker did not stop in time");
            }
        }
        info!("worker pool stopped");
    }
}
