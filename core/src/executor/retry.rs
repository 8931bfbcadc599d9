//! Retry classification
//!
//! Transient agent-backend errors are recognized from the subprocess
//! output and retried inside the executor at a fixed short delay, without
//! consuming task attempts. Everything else goes through the scheduler's
//! exponential backoff curve.

use chrono::Duration;
use regex::Regex;
use std::sync::OnceLock;

/// Statuses worth retrying in place.
const TRANSIENT_STATUSES: &[u16] = &[429, 500, 502, 503, 504, 529];

fn api_error_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"API Error: (\d{3}) (\{.*\})").expect("api error regex"))
}

/// Match `API Error: <status> <json>` anywhere in the output and return the
/// status and payload when the status is in the transient set.
pub fn classify_api_error(output: &str) -> Option<(u16, String)> {
    let caps = api_error_re().captures(output)?;
    let status: u16 = caps.get(1)?.as_str().parse().ok()?;
    if !TRANSIENT_STATUSES.contains(&status) {
        return None;
    }
    Some((status, caps.get(2)?.as_str().to_string()))
}

/// Task-level backoff: delay before retry number `attempt_count + 1`,
/// given the configured curve (minutes). The last entry saturates.
pub fn backoff_delay(curve_minutes: &[u64], attempt_count: u32) -> Duration {
    if curve_minutes.is_empty() {
        return Duration::minutes(1);
    }
    let index = (attempt_count.saturating_sub(1) as usize).min(curve_minutes.len() - 1);
    Duration::minutes(curve_minutes[index] as i64)
}
