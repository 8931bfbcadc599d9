//! File poller: unchecked TASKS.md lines become background tasks
//!
//! The cursor holds the file's content hash plus the hashes of lines
//! already enqueued. Checking a box, editing or removing a line never
//! replays it; only genuinely new unchecked lines produce tasks.

use super::{Poller, PollerCtx};
use crate::error::Result;
use crate::store::{NewTask, SourceType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, warn};

pub struct FileTasksPoller;

#[derive(Debug, Default, Serialize, Deserialize)]
struct FileCursor {
    content_hash: String,
    #[serde(default)]
    seen_lines: BTreeSet<String>,
}

#[async_trait]
impl Poller for FileTasksPoller {
    fn name(&self) -> &'static str {
        "file-tasks"
    }

    fn cadence(&self) -> Duration {
        Duration::from_secs(30)
    }

    async fn tick(&self, ctx: &PollerCtx) -> Result<()> {
        for (user_id, user) in &ctx.config.users {
            let Some(path) = &user.tasks_file else { continue };

            let content = match tokio::fs::read_to_string(path).await {
                Ok(content) => content,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    warn!(%user_id, path = %path.display(), %err, "cannot read tasks file");
                    continue;
                }
            };

            let content_hash = digest(&content);
            let mut cursor: FileCursor =
                ctx.store.get_poller_state("file-tasks", user_id)?.unwrap_or_default();
            if cursor.content_hash == content_hash {
                continue;
            }

            for line in unchecked_lines(&content) {
                let key = digest(line);
                if !cursor.seen_lines.insert(key) {
                    continue;
                }
                let new = NewTask::prompt(user_id, SourceType::File, line);
                let task_id = ctx.store.create_task(&new, ctx.now)?;
                debug!(%user_id, task_id, "enqueued task from file line");
            }

            cursor.content_hash = content_hash;
            ctx.store.put_poller_state("file-tasks", user_id, &cursor, ctx.now)?;
        }
        Ok(())
    }
}

/// Lines of the form `- [ ] do something`, with the marker stripped.
fn unchecked_lines(content: &str) -> impl Iterator<Item = &str> {
    content.lines().filter_map(|line| {
        line.trim_start()
            .strip_prefix("- [ ]")
            .map(str::trim)
            .filter(|rest| !rest.is_empty())
    })
}

fn digest(input: &str) -> String {
    hex::encode(Sha256::digest(input.trim().as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::Channels;
    use crate::config::{Config, UserConfig};
    use crate::store::{Store, TaskFilter};
    use chrono::{TimeZone, Utc};
    use std::path::PathBuf;
    use std::sync::Arc;

    fn temp_file() -> PathBuf {
        std::env::temp_dir().join(format!("istota-test-tasks-{}.md", uuid::Uuid::new_v4()))
    }

    fn ctx(path: PathBuf) -> PollerCtx {
        let mut config = Config::default();
        config.users.insert(
            "alice".to_string(),
            UserConfig { tasks_file: Some(path), ..Default::default() },
        );
        PollerCtx {
            store: Arc::new(Store::open_in_memory().unwrap()),
            config: Arc::new(config),
            channels: Channels::disabled(),
            now: Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn parses_only_unchecked_lines() {
        let content = "# TODO\n- [ ] water the plants\n- [x] done already\n- [ ]   \ntext\n";
        let lines: Vec<&str> = unchecked_lines(content).collect();
        assert_eq!(lines, vec!["water the plants"]);
    }

    #[tokio::test]
    async fn new_lines_fire_once_and_checked_lines_never_replay() {
        let path = temp_file();
        std::fs::write(&path, "- [ ] water the plants\n").unwrap();
        let ctx = ctx(path.clone());

        FileTasksPoller.tick(&ctx).await.unwrap();
        assert_eq!(ctx.store.list_tasks(&TaskFilter::default()).unwrap().len(), 1);

        // Unchanged file: no-op.
        FileTasksPoller.tick(&ctx).await.unwrap();
        assert_eq!(ctx.store.list_tasks(&TaskFilter::default()).unwrap().len(), 1);

        // Checking the box and adding a new line fires only the new line.
        std::fs::write(&path, "- [x] water the plants\n- [ ] feed the cat\n").unwrap();
        FileTasksPoller.tick(&ctx).await.unwrap();
        let tasks = ctx.store.list_tasks(&TaskFilter::default()).unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().any(|t| t.prompt.as_deref() == Some("feed the cat")));

        // Un-checking a previously seen line does not replay it.
        std::fs::write(&path, "- [ ] water the plants\n- [ ] feed the cat\n").unwrap();
        FileTasksPoller.tick(&ctx).await.unwrap();
        assert_eq!(ctx.store.list_tasks(&TaskFilter::default()).unwrap().len(), 2);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn missing_file_is_not_an_error() {
        let ctx = ctx(temp_file());
        FileTasksPoller.tick(&ctx).await.unwrap();
        assert!(ctx.store.list_tasks(&TaskFilter::default()).unwrap().is_empty());
    }
}
