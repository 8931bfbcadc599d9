//! Deferred-effects processor
//!
//! The agent subprocess may run in a sandbox with no database access, so
//! it records intended side effects as JSON files in its always-writable
//! deferred directory. After a task completes successfully the scheduler
//! applies them here: subtask creation and transaction tracking. Files are
//! deleted once consumed; a missing file is a no-op, so processing is
//! idempotent. Anything unrecognized is deleted unprocessed.

use crate::config::Config;
use crate::error::Result;
use crate::store::transactions::TransactionBatch;
use crate::store::{NewTask, SourceType, Store, Task};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One requested subtask, as written by the agent
#[derive(Debug, Deserialize)]
struct SubtaskRequest {
    prompt: String,
    #[serde(default)]
    conversation_token: Option<String>,
    #[serde(default)]
    priority: Option<u8>,
}

pub struct DeferredEffects {
    store: Arc<Store>,
    config: Arc<Config>,
}

impl DeferredEffects {
    pub fn new(store: Arc<Store>, config: Arc<Config>) -> Self {
        Self { store, config }
    }

    /// Consume every effect file the completed `task` left behind.
    /// Returns the ids of subtasks created.
    pub async fn process(
        &self,
        task: &Task,
        deferred_dir: &Path,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>> {
        let mut created = Vec::new();

        let subtasks_file = deferred_dir.join(format!("task_{}_subtasks.json", task.id));
        if let Some(raw) = consume(&subtasks_file).await {
            if self.config.is_admin(&task.user_id) {
                match serde_json::from_str::<Vec<SubtaskRequest>>(&raw) {
                    Ok(requests) => {
                        for request in requests {
                            match self.create_subtask(task, request, now) {
                                Ok(id) => created.push(id),
                                Err(err) => {
                                    warn!(parent = task.id, %err, "subtask rejected");
                                }
                            }
                        }
                        info!(parent = task.id, count = created.len(), "created subtasks");
                    }
                    Err(err) => warn!(parent = task.id, %err, "unparseable subtasks file"),
                }
            } else {
                // Subtask creation is admin-only; silently drop the file.
                debug!(parent = task.id, user = %task.user_id, "ignoring subtasks from non-admin");
            }
        }

        let transactions_file =
            deferred_dir.join(format!("task_{}_tracked_transactions.json", task.id));
        if let Some(raw) = consume(&transactions_file).await {
            match serde_json::from_str::<TransactionBatch>(&raw) {
                Ok(batch) if !batch.is_empty() => {
                    let applied =
                        self.store.apply_transaction_batch(&task.user_id, &batch, now)?;
                    info!(parent = task.id, applied, "applied tracked transactions");
                }
                Ok(_) => {}
                Err(err) => warn!(parent = task.id, %err, "unparseable transactions file"),
            }
        }

        self.sweep_unknown(task, deferred_dir).await;
        Ok(created)
    }

    fn create_subtask(
        &self,
        parent: &Task,
        request: SubtaskRequest,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let mut new = NewTask::prompt(&parent.user_id, SourceType::Subtask, request.prompt);
        new.queue = parent.queue;
        new.parent_task_id = Some(parent.id);
        new.conversation_token =
            request.conversation_token.or_else(|| parent.conversation_token.clone());
        if let Some(priority) = request.priority {
            new.priority = priority;
        }
        self.store.create_task(&new, now)
    }

    /// Any other file this task left in the deferred dir is deleted unread.
    async fn sweep_unknown(&self, task: &Task, deferred_dir: &Path) {
        let prefix = format!("task_{}_", task.id);
        let Ok(mut entries) = tokio::fs::read_dir(deferred_dir).await else { return };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&prefix) {
                debug!(parent = task.id, file = %name, "deleting unrecognized effect file");
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
    }
}

/// Read and delete in one motion; `None` when the file doesn't exist.
async fn consume(path: &Path) -> Option<String> {
    let raw = tokio::fs::read_to_string(path).await.ok()?;
    let _ = tokio::fs::remove_file(path).await;
    Some(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserConfig;
    use crate::store::{TaskFilter, TaskQueue};
    use chrono::TimeZone;
    use std::path::PathBuf;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn temp_dir() -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("istota-test-effects-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn setup(admin: bool) -> (Arc<Store>, Arc<Config>, Task) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mut config = Config::default();
        config
            .users
            .insert("alice".into(), UserConfig { admin, ..Default::default() });

        let mut new = NewTask::prompt("alice", SourceType::Chat, "parent work");
        new.queue = TaskQueue::Background;
        new.conversation_token = Some("room-1".into());
        let id = store.create_task(&new, now()).unwrap();
        let task = store.get_task(id).unwrap().unwrap();
        (store, Arc::new(config), task)
    }

    #[tokio::test]
    async fn subtasks_inherit_queue_and_parent() {
        let (store, config, task) = setup(true);
        let dir = temp_dir();
        std::fs::write(
            dir.join(format!("task_{}_subtasks.json", task.id)),
            r#"[{"prompt": "step one"}, {"prompt": "step two", "priority": 8}]"#,
        )
        .unwrap();

        let effects = DeferredEffects::new(store.clone(), config);
        let created = effects.process(&task, &dir, now()).await.unwrap();
        assert_eq!(created.len(), 2);

        let subtasks = store
            .list_tasks(&TaskFilter {
                source_type: Some(SourceType::Subtask),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(subtasks.len(), 2);
        for subtask in &subtasks {
            assert_eq!(subtask.queue, TaskQueue::Background);
            assert_eq!(subtask.parent_task_id, Some(task.id));
            assert_eq!(subtask.conversation_token.as_deref(), Some("room-1"));
        }
        assert!(subtasks.iter().any(|t| t.priority == 8));

        // The file is gone; processing again is a no-op.
        let created = effects.process(&task, &dir, now()).await.unwrap();
        assert!(created.is_empty());
        assert_eq!(
            store
                .list_tasks(&TaskFilter {
                    source_type: Some(SourceType::Subtask),
                    ..Default::default()
                })
                .unwrap()
                .len(),
            2
        );

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn non_admin_subtasks_are_dropped() {
        let (store, config, task) = setup(false);
        let dir = temp_dir();
        let file = dir.join(format!("task_{}_subtasks.json", task.id));
        std::fs::write(&file, r#"[{"prompt": "sneaky"}]"#).unwrap();

        DeferredEffects::new(store.clone(), config).process(&task, &dir, now()).await.unwrap();

        assert!(!file.exists(), "file should be deleted even when ignored");
        assert!(store
            .list_tasks(&TaskFilter { source_type: Some(SourceType::Subtask), ..Default::default() })
            .unwrap()
            .is_empty());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn transactions_apply_and_unknown_files_are_swept() {
        let (store, config, task) = setup(true);
        let dir = temp_dir();
        std::fs::write(
            dir.join(format!("task_{}_tracked_transactions.json", task.id)),
            r#"{"imported": [{"external_id": "tx-9", "category": "transport"}]}"#,
        )
        .unwrap();
        let stray = dir.join(format!("task_{}_mystery.json", task.id));
        std::fs::write(&stray, "{}").unwrap();
        // Another task's file is untouched.
        let other = dir.join("task_9999_subtasks.json");
        std::fs::write(&other, "[]").unwrap();

        DeferredEffects::new(store.clone(), config).process(&task, &dir, now()).await.unwrap();

        assert_eq!(store.count_tracked_transactions("alice").unwrap(), 1);
        assert!(!stray.exists());
        assert!(other.exists());

        let _ = std::fs::remove_dir_all(dir);
    }
}
