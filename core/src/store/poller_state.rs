//! Cursor storage for idempotent poller resumption
//!
//! One generic `(poller, key)`-keyed table; each poller defines its own
//! cursor shape and serializes it as JSON. Advancing the cursor is the only
//! way a poller makes progress, so replaying a tick with an unchanged
//! cursor is a no-op.

use super::{fmt_ts, Store};
use crate::error::Result;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::de::DeserializeOwned;
use serde::Serialize;

impl Store {
    /// Load the cursor for `(poller, key)`, deserialized into the poller's
    /// own cursor type.
    pub fn get_poller_state<T: DeserializeOwned>(
        &self,
        poller: &str,
        key: &str,
    ) -> Result<Option<T>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT cursor FROM poller_state WHERE poller = ?1 AND key = ?2")?;
            match stmt.query_row(params![poller, key], |row| row.get::<_, String>(0)) {
                Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(err) => Err(err.into()),
            }
        })
    }

    pub fn put_poller_state<T: Serialize>(
        &self,
        poller: &str,
        key: &str,
        cursor: &T,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let raw = serde_json::to_string(cursor)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO poller_state (poller, key, cursor, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (poller, key) DO UPDATE SET
                     cursor = excluded.cursor,
                     updated_at = excluded.updated_at",
                params![poller, key, raw, fmt_ts(now)],
            )?;
            Ok(())
        })
    }

    /// All keys a poller has state for.
    pub fn list_poller_keys(&self, poller: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT key FROM poller_state WHERE poller = ?1 ORDER BY key")?;
            let rows = stmt.query_map(params![poller], |row| row.get(0))?;
            let mut keys = Vec::new();
            for row in rows {
                keys.push(row?);
            }
            Ok(keys)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct ChatCursor {
        last_message_id: i64,
    }

    #[test]
    fn cursor_round_trips_and_upserts() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();

        assert_eq!(store.get_poller_state::<ChatCursor>("chat", "room-1").unwrap(), None);

        store
            .put_poller_state("chat", "room-1", &ChatCursor { last_message_id: 10 }, now)
            .unwrap();
        store
            .put_poller_state("chat", "room-1", &ChatCursor { last_message_id: 25 }, now)
            .unwrap();

        assert_eq!(
            store.get_poller_state::<ChatCursor>("chat", "room-1").unwrap(),
            Some(ChatCursor { last_message_id: 25 })
        );
        assert_eq!(store.list_poller_keys("chat").unwrap(), vec!["room-1".to_string()]);
        // Other pollers see their own namespace.
        assert_eq!(store.get_poller_state::<ChatCursor>("email", "room-1").unwrap(), None);
    }
}
