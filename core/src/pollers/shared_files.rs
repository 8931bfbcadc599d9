//! Shared-file discovery: new files in a user's shared directory become
//! resource rows the prompt builder can list

use super::{Poller, PollerCtx};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

pub struct SharedFilesPoller;

#[derive(Debug, Default, Serialize, Deserialize)]
struct ScanCursor {
    last_scan_at: Option<DateTime<Utc>>,
}

#[async_trait]
impl Poller for SharedFilesPoller {
    fn name(&self) -> &'static str {
        "shared-files"
    }

    fn cadence(&self) -> Duration {
        Duration::from_secs(120)
    }

    async fn tick(&self, ctx: &PollerCtx) -> Result<()> {
        for (user_id, user) in &ctx.config.users {
            let Some(dir) = &user.shared_dir else { continue };

            let cursor: ScanCursor =
                ctx.store.get_poller_state("shared-files", user_id)?.unwrap_or_default();

            let mut entries = match tokio::fs::read_dir(dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    warn!(%user_id, dir = %dir.display(), %err, "cannot scan shared dir");
                    continue;
                }
            };

            while let Some(entry) = entries.next_entry().await? {
                let metadata = entry.metadata().await?;
                if !metadata.is_file() {
                    continue;
                }
                let modified: DateTime<Utc> = metadata
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or(ctx.now);
                if cursor.last_scan_at.is_some_and(|last| modified <= last) {
                    continue;
                }

                let path = entry.path();
                let display_name =
                    path.file_stem().map(|stem| stem.to_string_lossy().into_owned());
                ctx.store.upsert_resource(
                    user_id,
                    resource_type_for(&path),
                    &path.to_string_lossy(),
                    "read",
                    display_name.as_deref(),
                    ctx.now,
                )?;
                debug!(%user_id, path = %path.display(), "discovered shared resource");
            }

            ctx.store.put_poller_state(
                "shared-files",
                user_id,
                &ScanCursor { last_scan_at: Some(ctx.now) },
                ctx.now,
            )?;
        }
        Ok(())
    }
}

fn resource_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).unwrap_or("").to_lowercase().as_str() {
        "ods" | "xlsx" | "csv" => "spreadsheet",
        "md" | "txt" | "doc" | "docx" | "odt" | "pdf" => "document",
        "png" | "jpg" | "jpeg" | "webp" | "heic" => "image",
        "json" | "yaml" | "yml" | "toml" => "data",
        _ => "file",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::Channels;
    use crate::config::{Config, UserConfig};
    use crate::store::Store;
    use chrono::TimeZone;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("istota-test-shared-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn ctx(dir: PathBuf) -> PollerCtx {
        let mut config = Config::default();
        config.users.insert(
            "alice".to_string(),
            UserConfig { shared_dir: Some(dir), ..Default::default() },
        );
        PollerCtx {
            store: Arc::new(Store::open_in_memory().unwrap()),
            config: Arc::new(config),
            channels: Channels::disabled(),
            now: Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn extension_maps_to_resource_type() {
        assert_eq!(resource_type_for(Path::new("/x/budget.ods")), "spreadsheet");
        assert_eq!(resource_type_for(Path::new("/x/notes.md")), "document");
        assert_eq!(resource_type_for(Path::new("/x/cat.png")), "image");
        assert_eq!(resource_type_for(Path::new("/x/unknown.bin")), "file");
    }

    #[tokio::test]
    async fn discovers_files_and_skips_already_scanned() {
        let dir = temp_dir();
        std::fs::write(dir.join("budget.ods"), b"x").unwrap();
        let ctx = ctx(dir.clone());

        SharedFilesPoller.tick(&ctx).await.unwrap();
        let resources = ctx.store.list_resources("alice").unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].resource_type, "spreadsheet");
        assert_eq!(resources[0].display_name.as_deref(), Some("budget"));

        // A second tick at the same instant rediscovers nothing new and
        // the upsert keeps the row count stable either way.
        SharedFilesPoller.tick(&ctx).await.unwrap();
        assert_eq!(ctx.store.list_resources("alice").unwrap().len(), 1);

        let _ = std::fs::remove_dir_all(dir);
    }
}
