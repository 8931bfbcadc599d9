//! Tracked-transaction batches reported by the sandboxed agent
//!
//! The agent cannot write the database from inside its sandbox; it records
//! synced/imported/recategorized transactions in a deferred-effects file and
//! the scheduler applies the whole batch here in one transaction.

use super::{fmt_ts, Store};
use crate::error::Result;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

/// One transaction record as the agent reports it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedTransaction {
    pub external_id: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

/// The deferred-effects file body for transaction tracking
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionBatch {
    #[serde(default)]
    pub synced: Vec<TrackedTransaction>,
    #[serde(default)]
    pub imported: Vec<TrackedTransaction>,
    #[serde(default)]
    pub recategorized: Vec<TrackedTransaction>,
}

impl TransactionBatch {
    pub fn is_empty(&self) -> bool {
        self.synced.is_empty() && self.imported.is_empty() && self.recategorized.is_empty()
    }
}

impl Store {
    /// Apply a whole batch atomically. Re-applying the same batch leaves
    /// the table in the same state.
    pub fn apply_transaction_batch(
        &self,
        user_id: &str,
        batch: &TransactionBatch,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let ts = fmt_ts(now);
        self.with_tx(|tx| {
            let mut applied = 0usize;
            for (status, records) in [
                ("synced", &batch.synced),
                ("imported", &batch.imported),
                ("recategorized", &batch.recategorized),
            ] {
                for record in records {
                    tx.execute(
                        "INSERT INTO tracked_transactions
                             (user_id, external_id, status, category, payload, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                         ON CONFLICT (user_id, external_id) DO UPDATE SET
                             status = excluded.status,
                             category = excluded.category,
                             payload = excluded.payload,
                             updated_at = excluded.updated_at",
                        params![
                            user_id,
                            record.external_id,
                            status,
                            record.category,
                            serde_json::to_string(&record.payload)?,
                            ts,
                        ],
                    )?;
                    applied += 1;
                }
            }
            Ok(applied)
        })
    }

    pub fn count_tracked_transactions(&self, user_id: &str) -> Result<u32> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM tracked_transactions WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )?;
            Ok(n as u32)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn batch_applies_atomically_and_idempotently() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();

        let batch: TransactionBatch = serde_json::from_str(
            r#"{
                "synced": [{"external_id": "tx-1", "amount": "12.30"}],
                "recategorized": [{"external_id": "tx-2", "category": "groceries"}]
            }"#,
        )
        .unwrap();

        assert_eq!(store.apply_transaction_batch("alice", &batch, now).unwrap(), 2);
        assert_eq!(store.count_tracked_transactions("alice").unwrap(), 2);

        // Applying the same batch twice produces the same store state.
        assert_eq!(store.apply_transaction_batch("alice", &batch, now).unwrap(), 2);
        assert_eq!(store.count_tracked_transactions("alice").unwrap(), 2);
    }
}
