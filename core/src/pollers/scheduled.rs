//! Scheduled-job poller: due cron jobs produce tasks
//!
//! `last_run_at` moves forward in the same tick that enqueues the task, so
//! one cron slot can never produce two tasks, and a backlog of missed
//! slots collapses into a single run.

use super::{Poller, PollerCtx};
use crate::error::Result;
use crate::store::{NewTask, ScheduledJob, SourceType, TaskQueue};
use async_trait::async_trait;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

pub struct ScheduledJobPoller;

#[async_trait]
impl Poller for ScheduledJobPoller {
    fn name(&self) -> &'static str {
        "scheduled-jobs"
    }

    fn cadence(&self) -> Duration {
        Duration::from_secs(60)
    }

    async fn tick(&self, ctx: &PollerCtx) -> Result<()> {
        for job in ctx.store.list_jobs(true)? {
            let timezone = ctx.config.user_timezone(&job.user_id);
            let due =
                match crate::cron::is_due(&job.cron_expression, &timezone, job.due_anchor(), ctx.now)
                {
                    Ok(due) => due,
                    Err(err) => {
                        warn!(job = %job.name, user = %job.user_id, %err, "job cron did not evaluate");
                        continue;
                    }
                };
            if !due {
                continue;
            }

            let task_id = ctx.store.create_task(&task_from_job(&job), ctx.now)?;
            ctx.store.record_job_run(job.id, ctx.now)?;
            debug!(job = %job.name, user = %job.user_id, task_id, "enqueued scheduled task");
        }
        Ok(())
    }
}

fn task_from_job(job: &ScheduledJob) -> NewTask {
    let mut new = match (&job.prompt, &job.command) {
        (Some(prompt), _) => NewTask::prompt(&job.user_id, SourceType::Scheduled, prompt),
        (None, Some(command)) => NewTask::command(&job.user_id, SourceType::Scheduled, command),
        (None, None) => NewTask::prompt(&job.user_id, SourceType::Scheduled, ""),
    };
    new.queue = TaskQueue::Background;
    new.conversation_token = job.conversation_token.clone();
    new.output_target = job.output_target.as_deref().and_then(|t| FromStr::from_str(t).ok());
    new.heartbeat_silent = job.silent_unless_action;
    new.scheduled_job_id = Some(job.id);
    new
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::Channels;
    use crate::config::Config;
    use crate::store::{NewScheduledJob, Store, TaskFilter};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn ctx() -> PollerCtx {
        PollerCtx {
            store: Arc::new(Store::open_in_memory().unwrap()),
            config: Arc::new(Config::default()),
            channels: Channels::disabled(),
            now: Utc.with_ymd_and_hms(2025, 3, 1, 9, 5, 0).unwrap(),
        }
    }

    fn seed_job(ctx: &PollerCtx, name: &str, silent: bool) -> i64 {
        ctx.store
            .upsert_job(
                &NewScheduledJob {
                    user_id: "alice".into(),
                    name: name.into(),
                    cron_expression: "0 9 * * *".into(),
                    prompt: Some("daily status".into()),
                    silent_unless_action: silent,
                    ..Default::default()
                },
                // Created before today's 09:00 slot.
                Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap(),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn due_job_fires_exactly_once_per_slot() {
        let ctx = ctx();
        let job_id = seed_job(&ctx, "daily", true);

        ScheduledJobPoller.tick(&ctx).await.unwrap();
        ScheduledJobPoller.tick(&ctx).await.unwrap();

        let tasks = ctx.store.list_tasks(&TaskFilter::default()).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].source_type, SourceType::Scheduled);
        assert_eq!(tasks[0].queue, TaskQueue::Background);
        assert_eq!(tasks[0].scheduled_job_id, Some(job_id));
        assert!(tasks[0].heartbeat_silent);
    }

    #[tokio::test]
    async fn missed_slots_coalesce() {
        let ctx = ctx();
        seed_job(&ctx, "daily", false);

        // Three days of downtime later, the job still fires only once.
        let mut late = ctx.clone();
        late.now = Utc.with_ymd_and_hms(2025, 3, 4, 12, 0, 0).unwrap();
        ScheduledJobPoller.tick(&late).await.unwrap();
        ScheduledJobPoller.tick(&late).await.unwrap();
        assert_eq!(late.store.list_tasks(&TaskFilter::default()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn disabled_jobs_do_not_fire() {
        let ctx = ctx();
        seed_job(&ctx, "daily", false);
        ctx.store.set_job_enabled("alice", "daily", false).unwrap();

        ScheduledJobPoller.tick(&ctx).await.unwrap();
        assert!(ctx.store.list_tasks(&TaskFilter::default()).unwrap().is_empty());
    }
}
