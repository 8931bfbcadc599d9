//! User resources: files and directories the agent may read or write

use super::{fmt_ts, parse_ts, Store};
use crate::error::{IstotaError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

#[derive(Debug, Clone)]
pub struct UserResource {
    pub id: i64,
    pub user_id: String,
    pub resource_type: String,
    pub resource_path: String,
    pub permissions: String,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl UserResource {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let created: String = row.get("created_at")?;
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            resource_type: row.get("resource_type")?,
            resource_path: row.get("resource_path")?,
            permissions: row.get("permissions")?,
            display_name: row.get("display_name")?,
            created_at: parse_ts(&created).unwrap_or_else(Utc::now),
        })
    }
}

impl Store {
    pub fn upsert_resource(
        &self,
        user_id: &str,
        resource_type: &str,
        resource_path: &str,
        permissions: &str,
        display_name: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        if !matches!(permissions, "read" | "readwrite") {
            return Err(IstotaError::InvalidTask {
                message: format!("unknown permissions: {permissions}"),
            });
        }
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO user_resources (user_id, resource_type, resource_path,
                                             permissions, display_name, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (user_id, resource_type, resource_path) DO UPDATE SET
                     permissions = excluded.permissions,
                     display_name = COALESCE(excluded.display_name, display_name)",
                params![user_id, resource_type, resource_path, permissions, display_name, fmt_ts(now)],
            )?;
            let id: i64 = conn.query_row(
                "SELECT id FROM user_resources
                 WHERE user_id = ?1 AND resource_type = ?2 AND resource_path = ?3",
                params![user_id, resource_type, resource_path],
                |row| row.get(0),
            )?;
            Ok(id)
        })
    }

    pub fn list_resources(&self, user_id: &str) -> Result<Vec<UserResource>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM user_resources WHERE user_id = ?1
                 ORDER BY resource_type, resource_path",
            )?;
            let rows = stmt.query_map(params![user_id], UserResource::from_row)?;
            let mut resources = Vec::new();
            for row in rows {
                resources.push(row?);
            }
            Ok(resources)
        })
    }

    pub fn remove_resource(&self, user_id: &str, resource_type: &str, resource_path: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM user_resources
                 WHERE user_id = ?1 AND resource_type = ?2 AND resource_path = ?3",
                params![user_id, resource_type, resource_path],
            )?;
            Ok(n > 0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn upsert_dedupes_on_natural_key() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();

        let id1 = store
            .upsert_resource("alice", "spreadsheet", "/shared/budget.ods", "read", None, now)
            .unwrap();
        let id2 = store
            .upsert_resource(
                "alice",
                "spreadsheet",
                "/shared/budget.ods",
                "readwrite",
                Some("Budget"),
                now,
            )
            .unwrap();
        assert_eq!(id1, id2);

        let resources = store.list_resources("alice").unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].permissions, "readwrite");
        assert_eq!(resources[0].display_name.as_deref(), Some("Budget"));
    }

    #[test]
    fn rejects_unknown_permissions() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        assert!(store
            .upsert_resource("alice", "doc", "/x", "execute", None, now)
            .is_err());
    }
}
