//! Atomic lease/unlease and stale-lock recovery
//!
//! Claiming runs five steps in one IMMEDIATE transaction: recover expired
//! locks and stuck runs first, then select the next claimable task with an
//! `UPDATE ... RETURNING`. No background cleaner touches locks; this is
//! the only place recovery happens.

use super::task::{Task, TaskQueue};
use super::{fmt_ts, Store};
use crate::error::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use tracing::{debug, warn};

/// A claim must turn into `running` (or be released) within this lease.
pub const LOCK_LEASE_MINUTES: i64 = 30;

impl Store {
    /// Claim the next task for `worker_id`, optionally filtered to one user
    /// and queue. Returns `None` when nothing is claimable; an empty queue
    /// makes no mutations beyond stale recovery.
    pub fn claim_task(
        &self,
        worker_id: &str,
        user_id: Option<&str>,
        queue: Option<TaskQueue>,
        max_retry_age: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>> {
        let ts = fmt_ts(now);
        let lease_cutoff = fmt_ts(now - Duration::minutes(LOCK_LEASE_MINUTES));
        let stale_cutoff = fmt_ts(now - max_retry_age);

        self.with_tx(|tx| {
            // 1. Locked past the lease and past the retry window: failed.
            let failed_locks = tx.execute(
                "UPDATE tasks
                 SET status = 'failed', error = 'lock expired beyond retry window',
                     completed_at = ?1, updated_at = ?1, locked_at = NULL, locked_by = NULL
                 WHERE status = 'locked' AND locked_at <= ?2 AND locked_at <= ?3",
                params![ts, lease_cutoff, stale_cutoff],
            )?;

            // 2. Locked past the lease but still inside the window: retry.
            let recovered_locks = tx.execute(
                "UPDATE tasks
                 SET status = 'pending', locked_at = NULL, locked_by = NULL, updated_at = ?1
                 WHERE status = 'locked' AND locked_at <= ?2",
                params![ts, lease_cutoff],
            )?;

            // 3. Running past the retry window: failed.
            let failed_runs = tx.execute(
                "UPDATE tasks
                 SET status = 'failed', error = 'worker lost beyond retry window',
                     completed_at = ?1, updated_at = ?1, worker_pid = NULL
                 WHERE status = 'running' AND started_at <= ?2",
                params![ts, stale_cutoff],
            )?;

            // 4. Running past the lease: back to pending while retries
            //    remain, otherwise failed.
            let recovered_runs = tx.execute(
                "UPDATE tasks
                 SET status = 'pending', locked_at = NULL, locked_by = NULL,
                     worker_pid = NULL, updated_at = ?1
                 WHERE status = 'running' AND started_at <= ?2
                   AND attempt_count < max_attempts",
                params![ts, lease_cutoff],
            )?;
            tx.execute(
                "UPDATE tasks
                 SET status = 'failed', error = 'worker lost with attempts exhausted',
                     completed_at = ?1, updated_at = ?1, worker_pid = NULL
                 WHERE status = 'running' AND started_at <= ?2",
                params![ts, lease_cutoff],
            )?;

            if failed_locks + failed_runs > 0 {
                warn!(failed_locks, failed_runs, "failed stale tasks beyond retry window");
            }
            if recovered_locks + recovered_runs > 0 {
                debug!(recovered_locks, recovered_runs, "recovered stuck tasks for retry");
            }

            // 5. Select and lock the next claimable task.
            let mut sql = String::from(
                "UPDATE tasks
                 SET status = 'locked', locked_at = ?1, locked_by = ?2, updated_at = ?1
                 WHERE id = (
                     SELECT id FROM tasks
                     WHERE status = 'pending'
                       AND (scheduled_for IS NULL OR scheduled_for <= ?1)",
            );
            let mut args: Vec<String> = vec![ts.clone(), worker_id.to_string()];
            if let Some(user_id) = user_id {
                args.push(user_id.to_string());
                sql.push_str(&format!(" AND user_id = ?{}", args.len()));
            }
            if let Some(queue) = queue {
                args.push(queue.as_str().to_string());
                sql.push_str(&format!(" AND queue = ?{}", args.len()));
            }
            sql.push_str(
                " ORDER BY priority DESC, created_at ASC LIMIT 1
                 )
                 RETURNING *",
            );

            let mut stmt = tx.prepare(&sql)?;
            match stmt.query_row(rusqlite::params_from_iter(args.iter()), Task::from_row) {
                Ok(task) => Ok(Some(task)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(err) => Err(err.into()),
            }
        })
    }
}
