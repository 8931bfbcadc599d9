//! Cleanup poller: confirmation expiry, retention sweeps, scratch hygiene

use super::{Poller, PollerCtx};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct CleanupPoller;

#[async_trait]
impl Poller for CleanupPoller {
    fn name(&self) -> &'static str {
        "cleanup"
    }

    fn cadence(&self) -> Duration {
        Duration::from_secs(60)
    }

    async fn tick(&self, ctx: &PollerCtx) -> Result<()> {
        // Confirmations nobody answered expire to cancelled; tell the user.
        let timeout = ChronoDuration::minutes(ctx.config.daemon.confirmation_timeout_minutes as i64);
        for task in ctx.store.expire_confirmations(timeout, ctx.now)? {
            info!(task_id = task.id, user = %task.user_id, "confirmation expired");
            let body = match &task.confirmation_prompt {
                Some(prompt) => format!("No answer in time, so I dropped this request: {prompt}"),
                None => "A pending confirmation expired and was cancelled.".to_string(),
            };
            if let Err(err) = ctx
                .channels
                .push
                .notify(&task.user_id, "Confirmation expired", &body, ctx.config.channels.push.priority)
                .await
            {
                debug!(task_id = task.id, %err, "expiry notification not delivered");
            }
        }

        let failed = ctx
            .store
            .fail_abandoned_pending(ctx.config.retention.max_pending_age_days, ctx.now)?;
        if failed > 0 {
            warn!(failed, "failed abandoned pending tasks");
        }

        let deleted = ctx.store.delete_old_tasks(ctx.config.retention.task_retention_days, ctx.now)?;
        if deleted > 0 {
            info!(deleted, "retention sweep removed old tasks");
        }

        sweep_scratch(ctx).await;
        Ok(())
    }
}

/// Remove per-task scratch directories older than the retention window.
async fn sweep_scratch(ctx: &PollerCtx) {
    let cutoff = ctx.now - ChronoDuration::days(ctx.config.retention.task_retention_days as i64);
    let Ok(mut entries) = tokio::fs::read_dir(&ctx.config.daemon.scratch_dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let Ok(metadata) = entry.metadata().await else { continue };
        if !metadata.is_dir() {
            continue;
        }
        let modified: Option<DateTime<Utc>> = metadata.modified().ok().map(DateTime::<Utc>::from);
        if modified.is_some_and(|m| m < cutoff) {
            if let Err(err) = tokio::fs::remove_dir_all(entry.path()).await {
                debug!(path = %entry.path().display(), %err, "scratch sweep skipped entry");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::testing::{RecordingPush, ScriptedChat, ScriptedEmail};
    use crate::channels::Channels;
    use crate::config::Config;
    use crate::store::{NewTask, SourceType, Store, TaskStatus};
    use chrono::TimeZone;
    use std::sync::Arc;

    fn ctx(push: Arc<RecordingPush>) -> PollerCtx {
        PollerCtx {
            store: Arc::new(Store::open_in_memory().unwrap()),
            config: Arc::new(Config::default()),
            channels: Channels {
                chat: Arc::new(ScriptedChat::default()),
                email: Arc::new(ScriptedEmail::default()),
                push,
            },
            now: Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn expired_confirmation_cancels_and_notifies() {
        let push = Arc::new(RecordingPush::default());
        let mut ctx = ctx(push.clone());

        let id = ctx
            .store
            .create_task(&NewTask::prompt("alice", SourceType::Chat, "buy it"), ctx.now)
            .unwrap();
        ctx.store
            .claim_task("w", None, None, ChronoDuration::hours(24), ctx.now)
            .unwrap();
        ctx.store.mark_running(id, None, ctx.now).unwrap();
        ctx.store.set_confirmation(id, "Spend $120?", ctx.now).unwrap();

        // Default timeout is 60 minutes; 61 minutes later it expires.
        ctx.now = Utc.with_ymd_and_hms(2025, 3, 1, 13, 1, 0).unwrap();
        CleanupPoller.tick(&ctx).await.unwrap();

        assert_eq!(ctx.store.get_task(id).unwrap().unwrap().status, TaskStatus::Cancelled);
        let notified = push.notified.lock();
        assert_eq!(notified.len(), 1);
        assert!(notified[0].2.contains("Spend $120?"));
    }

    #[tokio::test]
    async fn sweep_is_quiet_on_empty_store() {
        let push = Arc::new(RecordingPush::default());
        let ctx = ctx(push.clone());
        CleanupPoller.tick(&ctx).await.unwrap();
        assert!(push.notified.lock().is_empty());
    }
}
