//! Briefing poller: per-user cron briefings become background tasks

use super::{Poller, PollerCtx};
use crate::error::Result;
use crate::store::{NewTask, SourceType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

pub struct BriefingPoller;

#[derive(Debug, Default, Serialize, Deserialize)]
struct BriefingCursor {
    last_run_at: Option<DateTime<Utc>>,
}

#[async_trait]
impl Poller for BriefingPoller {
    fn name(&self) -> &'static str {
        "briefing"
    }

    fn cadence(&self) -> Duration {
        Duration::from_secs(60)
    }

    async fn tick(&self, ctx: &PollerCtx) -> Result<()> {
        for (user_id, user) in &ctx.config.users {
            for briefing in &user.briefings {
                let key = format!("{user_id}:{}", briefing.name);
                let cursor: BriefingCursor =
                    ctx.store.get_poller_state("briefing", &key)?.unwrap_or_default();

                // First observation anchors the schedule without firing, so
                // a fresh install doesn't replay the day's slot.
                let Some(anchor) = cursor.last_run_at else {
                    ctx.store.put_poller_state(
                        "briefing",
                        &key,
                        &BriefingCursor { last_run_at: Some(ctx.now) },
                        ctx.now,
                    )?;
                    continue;
                };

                let due = match crate::cron::is_due(&briefing.cron, &user.timezone, anchor, ctx.now)
                {
                    Ok(due) => due,
                    Err(err) => {
                        warn!(%key, %err, "briefing cron did not evaluate");
                        continue;
                    }
                };
                if !due {
                    continue;
                }

                let mut new = NewTask::prompt(user_id, SourceType::Briefing, &briefing.prompt);
                new.output_target =
                    briefing.output_target.as_deref().and_then(|t| FromStr::from_str(t).ok());
                new.heartbeat_silent = briefing.silent;
                let task_id = ctx.store.create_task(&new, ctx.now)?;
                debug!(%key, task_id, "enqueued briefing task");

                ctx.store.put_poller_state(
                    "briefing",
                    &key,
                    &BriefingCursor { last_run_at: Some(ctx.now) },
                    ctx.now,
                )?;
            }
        }
        Ok(())
    }
}
