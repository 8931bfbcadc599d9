//! Sleep-cycle poller: nightly memory extraction per user and per channel
//!
//! When the cron slot passes and new conversation happened since the last
//! cycle, a background task asks the agent to distill it into long-term
//! memory. The high-water mark is the newest completed task id, so quiet
//! scopes are skipped entirely.

use super::{Poller, PollerCtx};
use crate::error::Result;
use crate::store::{NewTask, SourceType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

pub struct SleepCyclePoller;

#[derive(Debug, Default, Serialize, Deserialize)]
struct SleepCursor {
    last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    last_processed_task_id: Option<i64>,
}

#[async_trait]
impl Poller for SleepCyclePoller {
    fn name(&self) -> &'static str {
        "sleep-cycle"
    }

    fn cadence(&self) -> Duration {
        Duration::from_secs(60)
    }

    async fn tick(&self, ctx: &PollerCtx) -> Result<()> {
        for (user_id, user) in &ctx.config.users {
            let Some(sleep) = &user.sleep_cycle else { continue };
            if !sleep.enabled {
                continue;
            }

            // One scope for the user at large, one per chat channel.
            let mut scopes = vec![(user_id.clone(), None)];
            for token in &user.chat_tokens {
                scopes.push((format!("{user_id}:{token}"), Some(token.clone())));
            }

            for (key, token) in scopes {
                if let Err(err) = run_scope(ctx, user_id, &user.timezone, &sleep.cron, &key, token.as_deref()).await {
                    warn!(%key, %err, "sleep cycle failed");
                }
            }
        }
        Ok(())
    }
}

async fn run_scope(
    ctx: &PollerCtx,
    user_id: &str,
    timezone: &str,
    cron: &str,
    key: &str,
    token: Option<&str>,
) -> Result<()> {
    let cursor: SleepCursor =
        ctx.store.get_poller_state("sleep-cycle", key)?.unwrap_or_default();

    let Some(anchor) = cursor.last_run_at else {
        ctx.store.put_poller_state(
            "sleep-cycle",
            key,
            &SleepCursor { last_run_at: Some(ctx.now), ..Default::default() },
            ctx.now,
        )?;
        return Ok(());
    };

    if !crate::cron::is_due(cron, timezone, anchor, ctx.now)? {
        return Ok(());
    }

    let latest = ctx.store.latest_completed_task_id(user_id, token)?;
    let has_new_activity = match (latest, cursor.last_processed_task_id) {
        (Some(latest), Some(processed)) => latest > processed,
        (Some(_), None) => true,
        (None, _) => false,
    };

    if has_new_activity {
        let mut new = NewTask::prompt(user_id, SourceType::Briefing, extraction_prompt(token));
        new.conversation_token = token.map(String::from);
        new.heartbeat_silent = true;
        let task_id = ctx.store.create_task(&new, ctx.now)?;
        debug!(%key, task_id, "enqueued sleep-cycle task");
    }

    ctx.store.put_poller_state(
        "sleep-cycle",
        key,
        &SleepCursor { last_run_at: Some(ctx.now), last_processed_task_id: latest },
        ctx.now,
    )?;
    Ok(())
}

fn extraction_prompt(token: Option<&str>) -> String {
    match token {
        Some(token) => format!(
            "Review today's conversation in channel {token} and update the channel memory \
             with anything worth remembering: decisions, preferences, open threads. \
             Reply NO_ACTION: if nothing is worth keeping."
        ),
        None => "Review today's completed tasks and update long-term memory with durable \
                 facts about the user: preferences, routines, ongoing projects. \
                 Reply NO_ACTION: if nothing is worth keeping."
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::Channels;
    use crate::config::{Config, SleepCycleConfig, UserConfig};
    use crate::store::{Store, TaskFilter, TaskStatus};
    use chrono::TimeZone;
    use std::sync::Arc;

    fn ctx_at(day: u32, hour: u32) -> PollerCtx {
        let mut config = Config::default();
        config.users.insert(
            "alice".to_string(),
            UserConfig {
                sleep_cycle: Some(SleepCycleConfig { cron: "0 3 * * *".into(), enabled: true }),
                ..Default::default()
            },
        );
        PollerCtx {
            store: Arc::new(Store::open_in_memory().unwrap()),
            config: Arc::new(config),
            channels: Channels::disabled(),
            now: Utc.with_ymd_and_hms(2025, 3, day, hour, 0, 0).unwrap(),
        }
    }

    fn complete_task(ctx: &PollerCtx, prompt: &str) {
        let id = ctx
            .store
            .create_task(&NewTask::prompt("alice", SourceType::Chat, prompt), ctx.now)
            .unwrap();
        ctx.store
            .update_task_status(id, TaskStatus::Completed, Some("ok"), None, None, ctx.now)
            .unwrap();
    }

    #[tokio::test]
    async fn quiet_nights_produce_no_extraction() {
        let mut ctx = ctx_at(1, 12);
        SleepCyclePoller.tick(&ctx).await.unwrap();

        ctx.now = Utc.with_ymd_and_hms(2025, 3, 2, 3, 30, 0).unwrap();
        SleepCyclePoller.tick(&ctx).await.unwrap();
        assert!(ctx.store.list_tasks(&TaskFilter::default()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn activity_triggers_one_extraction_per_night() {
        let mut ctx = ctx_at(1, 12);
        SleepCyclePoller.tick(&ctx).await.unwrap();
        complete_task(&ctx, "book the dentist");

        ctx.now = Utc.with_ymd_and_hms(2025, 3, 2, 3, 30, 0).unwrap();
        SleepCyclePoller.tick(&ctx).await.unwrap();
        SleepCyclePoller.tick(&ctx).await.unwrap();

        let tasks = ctx
            .store
            .list_tasks(&TaskFilter { status: Some(TaskStatus::Pending), ..Default::default() })
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(tasks[0].heartbeat_silent);

        // The next night without new completions stays quiet.
        ctx.now = Utc.with_ymd_and_hms(2025, 3, 3, 3, 30, 0).unwrap();
        SleepCyclePoller.tick(&ctx).await.unwrap();
        let pending = ctx
            .store
            .list_tasks(&TaskFilter { status: Some(TaskStatus::Pending), ..Default::default() })
            .unwrap();
        assert_eq!(pending.len(), 1);
    }
}
