//! Cron evaluation anchored in per-user timezones
//!
//! Expressions are the classic 5-field form. The `cron` crate wants a
//! seconds field, so a literal `0` is prepended before parsing. Storage is
//! always UTC; only the evaluation happens in the user's timezone.

use crate::error::{IstotaError, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;

/// Parse a 5-field cron expression.
pub fn parse_expression(expression: &str) -> Result<Schedule> {
    let fields = expression.split_whitespace().count();
    if fields != 5 {
        return Err(IstotaError::InvalidCron {
            expression: expression.to_string(),
            message: format!("expected 5 fields, got {fields}"),
        });
    }
    Schedule::from_str(&format!("0 {expression}")).map_err(|e| IstotaError::InvalidCron {
        expression: expression.to_string(),
        message: e.to_string(),
    })
}

/// Parse an IANA timezone name such as "Europe/Warsaw".
pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| IstotaError::UnknownTimezone(name.to_string()))
}

/// The first fire time strictly after `anchor`, in UTC.
pub fn next_fire_after(
    expression: &str,
    timezone: &str,
    anchor: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    let schedule = parse_expression(expression)?;
    let tz = parse_timezone(timezone)?;
    let local_anchor = anchor.with_timezone(&tz);
    Ok(schedule.after(&local_anchor).next().map(|t| t.with_timezone(&Utc)))
}

/// Whether a job anchored at `anchor` (its last run, or creation time) is
/// due at `now`. Missed fires coalesce: however many slots elapsed since
/// the anchor, the answer is a single yes.
pub fn is_due(
    expression: &str,
    timezone: &str,
    anchor: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<bool> {
    match next_fire_after(expression, timezone, anchor)? {
        Some(next) => Ok(next <= now),
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn rejects_wrong_field_count() {
        assert!(parse_expression("* * * * * *").is_err());
        assert!(parse_expression("* * *").is_err());
        assert!(parse_expression("*/5 * * * *").is_ok());
    }

    #[test]
    fn next_fire_is_strictly_after_anchor() {
        let anchor = Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap();
        let next = next_fire_after("0 8 * * *", "UTC", anchor).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 2, 8, 0, 0).unwrap());
    }

    #[test]
    fn due_when_slot_elapsed() {
        let anchor = Utc.with_ymd_and_hms(2025, 3, 1, 7, 0, 0).unwrap();
        let before = Utc.with_ymd_and_hms(2025, 3, 1, 7, 59, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2025, 3, 1, 8, 1, 0).unwrap();
        assert!(!is_due("0 8 * * *", "UTC", anchor, before).unwrap());
        assert!(is_due("0 8 * * *", "UTC", anchor, after).unwrap());
    }

    #[test]
    fn missed_fires_coalesce_to_one() {
        // Anchor three days back; a daily job is simply "due", not due
        // three times.
        let anchor = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2025, 3, 4, 9, 30, 0).unwrap();
        assert!(is_due("0 9 * * *", "UTC", anchor, now).unwrap());
        // After firing once with the anchor moved to `now`, nothing is due
        // until the next slot.
        assert!(!is_due("0 9 * * *", "UTC", now, now).unwrap());
    }

    #[test]
    fn evaluates_in_user_timezone() {
        // 08:00 in Warsaw is 07:00 UTC during winter.
        let anchor = Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap();
        let next = next_fire_after("0 8 * * *", "Europe/Warsaw", anchor).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 1, 10, 7, 0, 0).unwrap());
    }

    #[test]
    fn unknown_timezone_is_rejected() {
        assert!(parse_timezone("Mars/Olympus").is_err());
        assert!(parse_timezone("Europe/Warsaw").is_ok());
    }
}
