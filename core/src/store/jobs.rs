//! Cron-defined job templates that produce tasks
//!
//! `(user_id, name)` is unique. Jobs auto-disable after a configured run of
//! consecutive failures; `once` jobs are removed after their first success.

use super::{fmt_ts, parse_ts, Store};
use crate::error::{IstotaError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub id: i64,
    pub user_id: String,
    pub name: String,
    pub cron_expression: String,
    pub prompt: Option<String>,
    pub command: Option<String>,
    pub conversation_token: Option<String>,
    pub output_target: Option<String>,
    pub enabled: bool,
    pub silent_unless_action: bool,
    pub once: bool,
    pub consecutive_failures: u32,
    pub created_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ScheduledJob {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let created: String = row.get("created_at")?;
        let last_run: Option<String> = row.get("last_run_at")?;
        let last_success: Option<String> = row.get("last_success_at")?;
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            name: row.get("name")?,
            cron_expression: row.get("cron_expression")?,
            prompt: row.get("prompt")?,
            command: row.get("command")?,
            conversation_token: row.get("conversation_token")?,
            output_target: row.get("output_target")?,
            enabled: row.get::<_, i64>("enabled")? != 0,
            silent_unless_action: row.get::<_, i64>("silent_unless_action")? != 0,
            once: row.get::<_, i64>("once")? != 0,
            consecutive_failures: row.get("consecutive_failures")?,
            created_at: parse_ts(&created).unwrap_or_else(Utc::now),
            last_run_at: last_run.as_deref().and_then(parse_ts),
            last_success_at: last_success.as_deref().and_then(parse_ts),
            last_error: row.get("last_error")?,
        })
    }

    /// The anchor for deciding whether a cron slot is due.
    pub fn due_anchor(&self) -> DateTime<Utc> {
        self.last_run_at.unwrap_or(self.created_at)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewScheduledJob {
    pub user_id: String,
    pub name: String,
    pub cron_expression: String,
    pub prompt: Option<String>,
    pub command: Option<String>,
    pub conversation_token: Option<String>,
    pub output_target: Option<String>,
    pub silent_unless_action: bool,
    pub once: bool,
}

impl Store {
    /// Insert or replace the job named `(user_id, name)`.
    pub fn upsert_job(&self, new: &NewScheduledJob, now: DateTime<Utc>) -> Result<i64> {
        if new.user_id.trim().is_empty() || new.name.trim().is_empty() {
            return Err(IstotaError::InvalidTask {
                message: "scheduled job needs user_id and name".into(),
            });
        }
        crate::cron::parse_expression(&new.cron_expression)?;
        let has_prompt = new.prompt.as_deref().is_some_and(|p| !p.trim().is_empty());
        let has_command = new.command.as_deref().is_some_and(|c| !c.trim().is_empty());
        if has_prompt == has_command {
            return Err(IstotaError::InvalidTask {
                message: "scheduled job needs exactly one of prompt or command".into(),
            });
        }

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO scheduled_jobs (user_id, name, cron_expression, prompt, command,
                                             conversation_token, output_target,
                                             silent_unless_action, once, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT (user_id, name) DO UPDATE SET
                     cron_expression = excluded.cron_expression,
                     prompt = excluded.prompt,
                     command = excluded.command,
                     conversation_token = excluded.conversation_token,
                     output_target = excluded.output_target,
                     silent_unless_action = excluded.silent_unless_action,
                     once = excluded.once,
                     enabled = 1,
                     consecutive_failures = 0",
                params![
                    new.user_id,
                    new.name,
                    new.cron_expression,
                    new.prompt,
                    new.command,
                    new.conversation_token,
                    new.output_target,
                    new.silent_unless_action as i64,
                    new.once as i64,
                    fmt_ts(now),
                ],
            )?;
            let id: i64 = conn.query_row(
                "SELECT id FROM scheduled_jobs WHERE user_id = ?1 AND name = ?2",
                params![new.user_id, new.name],
                |row| row.get(0),
            )?;
            Ok(id)
        })
    }

    pub fn get_job(&self, user_id: &str, name: &str) -> Result<Option<ScheduledJob>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM scheduled_jobs WHERE user_id = ?1 AND name = ?2")?;
            match stmt.query_row(params![user_id, name], ScheduledJob::from_row) {
                Ok(job) => Ok(Some(job)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(err) => Err(err.into()),
            }
        })
    }

    pub fn list_jobs(&self, enabled_only: bool) -> Result<Vec<ScheduledJob>> {
        let sql = if enabled_only {
            "SELECT * FROM scheduled_jobs WHERE enabled = 1 ORDER BY user_id, name"
        } else {
            "SELECT * FROM scheduled_jobs ORDER BY user_id, name"
        };
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map([], ScheduledJob::from_row)?;
            let mut jobs = Vec::new();
            for row in rows {
                jobs.push(row?);
            }
            Ok(jobs)
        })
    }

    /// Mark the slot consumed the moment its task is enqueued, so a crash
    /// between enqueue and execution cannot double-fire the slot.
    pub fn record_job_run(&self, id: i64, now: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE scheduled_jobs SET last_run_at = ?2 WHERE id = ?1",
                params![id, fmt_ts(now)],
            )?;
            Ok(())
        })
    }

    /// Success resets the failure streak; `once` jobs are removed.
    pub fn record_job_success(&self, id: i64, now: DateTime<Utc>) -> Result<()> {
        self.with_tx(|tx| {
            let once: i64 = match tx.query_row(
                "SELECT once FROM scheduled_jobs WHERE id = ?1",
                params![id],
                |row| row.get(0),
            ) {
                Ok(v) => v,
                Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(()),
                Err(err) => return Err(err.into()),
            };
            if once != 0 {
                tx.execute("DELETE FROM scheduled_jobs WHERE id = ?1", params![id])?;
            } else {
                tx.execute(
                    "UPDATE scheduled_jobs
                     SET consecutive_failures = 0, last_success_at = ?2, last_error = NULL
                     WHERE id = ?1",
                    params![id, fmt_ts(now)],
                )?;
            }
            Ok(())
        })
    }

    /// Record a failure; disable once the streak reaches `disable_threshold`.
    pub fn record_job_failure(
        &self,
        id: i64,
        error: &str,
        disable_threshold: u32,
    ) -> Result<bool> {
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE scheduled_jobs
                 SET consecutive_failures = consecutive_failures + 1, last_error = ?2
                 WHERE id = ?1",
                params![id, error],
            )?;
            let failures: u32 = tx.query_row(
                "SELECT consecutive_failures FROM scheduled_jobs WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            if failures >= disable_threshold {
                tx.execute("UPDATE scheduled_jobs SET enabled = 0 WHERE id = ?1", params![id])?;
                return Ok(true);
            }
            Ok(false)
        })
    }

    pub fn set_job_enabled(&self, user_id: &str, name: &str, enabled: bool) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE scheduled_jobs SET enabled = ?3, consecutive_failures = 0
                 WHERE user_id = ?1 AND name = ?2",
                params![user_id, name, enabled as i64],
            )?;
            if changed == 0 {
                return Err(IstotaError::JobNotFound {
                    user_id: user_id.to_string(),
                    name: name.to_string(),
                });
            }
            Ok(())
        })
    }
}
