//! Durable persistence for tasks, scheduled jobs, poller state and
//! resources
//!
//! A single SQLite database behind one connection. Writers serialize on
//! the connection mutex; every write runs as one transaction so partial
//! writes are never observable.

pub mod claim;
pub mod emails;
pub mod jobs;
pub mod poller_state;
pub mod resources;
pub mod task;
pub mod transactions;

pub use claim::LOCK_LEASE_MINUTES;
pub use emails::ProcessedEmail;
pub use jobs::{NewScheduledJob, ScheduledJob};
pub use resources::UserResource;
pub use task::{
    CancelOutcome, HistoryEntry, NewTask, OutputTarget, SourceType, Task, TaskFilter, TaskQueue,
    TaskStatus,
};

use crate::error::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;
use tracing::info;

macro_rules! migrations {
    ($($name:expr),*) => {{
        &[
            $(
                Migration {
                    name: $name,
                    sql: include_str!(concat!("migrations/", $name, ".sql")),
                }
            ),*
        ]
    }};
}

const MIGRATIONS: &[Migration] = migrations![
    "000_migration_table",
    "001_scheduled_jobs",
    "002_tasks",
    "003_poller_state",
    "004_user_resources",
    "005_processed_emails",
    "006_tracked_transactions"
];

#[derive(Debug)]
struct Migration {
    name: &'static str,
    sql: &'static str,
}

/// Handle to the istota database.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating if necessary) the database at `path` and bring the
    /// schema up to date.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        Self::migrate(&mut conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// In-memory database, used by tests and --dry-run.
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::migrate(&mut conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn migrate(conn: &mut Connection) -> Result<()> {
        let tx = conn.transaction()?;

        let max_version = max_migration(&tx);

        for (version, migration) in MIGRATIONS.iter().enumerate() {
            match max_version {
                Some(max) if max >= version as i64 => continue,
                _ => (),
            }

            tx.execute_batch(migration.sql)?;
            info!(version, name = migration.name, "applying migration");
            tx.execute(
                "INSERT INTO migrations (version, migration_time) VALUES (?1, strftime('%s', 'now'))",
                params![version as i64],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Run `f` with the connection. Reads and single-statement writes.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run `f` inside an IMMEDIATE transaction, committing on success.
    pub(crate) fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

fn max_migration(conn: &Connection) -> Option<i64> {
    let mut stmt = conn.prepare("SELECT MAX(version) FROM migrations").ok()?;
    stmt.query_row([], |row| row.get(0)).ok()?
}

/// Timestamps are stored as RFC 3339 UTC text with a fixed precision so
/// lexicographic comparison matches chronological order.
pub fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn migrations_apply_once() {
        let store = Store::open_in_memory().expect("open");
        store
            .with_conn(|conn| {
                let n: i64 = conn
                    .query_row("SELECT COUNT(*) FROM migrations", [], |row| row.get(0))
                    .map_err(crate::error::IstotaError::from)?;
                assert_eq!(n as usize, MIGRATIONS.len());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn reopening_on_disk_is_idempotent() {
        let dir = std::env::temp_dir().join(format!("istota-test-store-{}", uuid::Uuid::new_v4()));
        let path = dir.join("istota.db");

        {
            let _ = Store::open(&path).expect("first open");
        }
        let store = Store::open(&path).expect("second open");
        store
            .with_conn(|conn| {
                let n: i64 = conn
                    .query_row("SELECT COUNT(*) FROM migrations", [], |row| row.get(0))
                    .map_err(crate::error::IstotaError::from)?;
                assert_eq!(n as usize, MIGRATIONS.len());
                Ok(())
            })
            .unwrap();

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn timestamp_text_sorts_chronologically() {
        let early = Utc.with_ymd_and_hms(2025, 3, 1, 9, 59, 59).unwrap();
        let late = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        assert!(fmt_ts(early) < fmt_ts(late));
        assert_eq!(parse_ts(&fmt_ts(late)), Some(late));
    }
}
