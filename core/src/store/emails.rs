//! Processed-email bookkeeping
//!
//! The email poller's dedup set, plus the threading headers the delivery
//! router needs to keep replies in the original thread.

use super::{fmt_ts, parse_ts, Store};
use crate::error::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

#[derive(Debug, Clone)]
pub struct ProcessedEmail {
    pub id: i64,
    pub email_id: String,
    pub message_id: Option<String>,
    pub references_header: Option<String>,
    pub sender: String,
    pub subject: Option<String>,
    pub task_id: Option<i64>,
    pub processed_at: DateTime<Utc>,
}

impl ProcessedEmail {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let processed: String = row.get("processed_at")?;
        Ok(Self {
            id: row.get("id")?,
            email_id: row.get("email_id")?,
            message_id: row.get("message_id")?,
            references_header: row.get("references_header")?,
            sender: row.get("sender")?,
            subject: row.get("subject")?,
            task_id: row.get("task_id")?,
            processed_at: parse_ts(&processed).unwrap_or_else(Utc::now),
        })
    }
}

impl Store {
    pub fn is_email_processed(&self, email_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM processed_emails WHERE email_id = ?1",
                params![email_id],
                |row| row.get(0),
            )?;
            Ok(n > 0)
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record_processed_email(
        &self,
        email_id: &str,
        message_id: Option<&str>,
        references_header: Option<&str>,
        sender: &str,
        subject: Option<&str>,
        task_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO processed_emails
                     (email_id, message_id, references_header, sender, subject, task_id, processed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![email_id, message_id, references_header, sender, subject, task_id, fmt_ts(now)],
            )?;
            Ok(())
        })
    }

    /// Threading headers for the email that produced `task_id`.
    pub fn email_for_task(&self, task_id: i64) -> Result<Option<ProcessedEmail>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM processed_emails WHERE task_id = ?1")?;
            match stmt.query_row(params![task_id], ProcessedEmail::from_row) {
                Ok(email) => Ok(Some(email)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(err) => Err(err.into()),
            }
        })
    }
}
