//! Heartbeat poller: cheap local checks with threshold-gated alerts
//!
//! Each check runs at its own cron cadence. Failures accumulate; once the
//! streak crosses the threshold a push notification goes out, rate-limited
//! by the cooldown. Checks never produce tasks.

use super::{Poller, PollerCtx};
use crate::config::HeartbeatConfig;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

pub struct HeartbeatPoller;

/// Checks are local and cheap; anything slower than this is a failure.
const CHECK_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Default, Serialize, Deserialize)]
struct HeartbeatCursor {
    last_check_at: Option<DateTime<Utc>>,
    last_alert_at: Option<DateTime<Utc>>,
    #[serde(default)]
    consecutive_errors: u32,
}

#[async_trait]
impl Poller for HeartbeatPoller {
    fn name(&self) -> &'static str {
        "heartbeat"
    }

    fn cadence(&self) -> Duration {
        Duration::from_secs(60)
    }

    async fn tick(&self, ctx: &PollerCtx) -> Result<()> {
        for (user_id, user) in &ctx.config.users {
            for check in &user.heartbeats {
                let key = format!("{user_id}:{}", check.name);
                if let Err(err) = run_check(ctx, user_id, &user.timezone, check, &key).await {
                    warn!(%key, %err, "heartbeat check errored");
                }
            }
        }
        Ok(())
    }
}

async fn run_check(
    ctx: &PollerCtx,
    user_id: &str,
    timezone: &str,
    check: &HeartbeatConfig,
    key: &str,
) -> Result<()> {
    let mut cursor: HeartbeatCursor =
        ctx.store.get_poller_state("heartbeat", key)?.unwrap_or_default();

    let due = match cursor.last_check_at {
        Some(anchor) => crate::cron::is_due(&check.cron, timezone, anchor, ctx.now)?,
        None => true,
    };
    if !due {
        return Ok(());
    }

    let healthy = execute_check(&check.command).await;
    cursor.last_check_at = Some(ctx.now);
    if healthy {
        cursor.consecutive_errors = 0;
    } else {
        cursor.consecutive_errors += 1;
        debug!(%key, streak = cursor.consecutive_errors, "heartbeat check failed");

        let cooled_down = cursor.last_alert_at.is_none_or(|last| {
            ctx.now - last >= ChronoDuration::minutes(check.alert_cooldown_minutes as i64)
        });
        if cursor.consecutive_errors >= check.failure_threshold && cooled_down {
            let body = format!(
                "Heartbeat '{}' has failed {} times in a row.",
                check.name, cursor.consecutive_errors
            );
            if let Err(err) = ctx
                .channels
                .push
                .notify(user_id, "Heartbeat alert", &body, ctx.config.channels.push.priority)
                .await
            {
                warn!(%key, %err, "heartbeat alert delivery failed");
            } else {
                cursor.last_alert_at = Some(ctx.now);
            }
        }
    }

    ctx.store.put_poller_state("heartbeat", key, &cursor, ctx.now)?;
    Ok(())
}

async fn execute_check(command: &str) -> bool {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd.stdout(std::process::Stdio::null());
    cmd.stderr(std::process::Stdio::null());

    match tokio::time::timeout(Duration::from_secs(CHECK_TIMEOUT_SECS), cmd.status()).await {
        Ok(Ok(status)) => status.success(),
        _ => false,
    }
}
