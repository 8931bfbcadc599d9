//! Email poller: new mail from known senders becomes foreground tasks
//!
//! The processed-email table is the dedup set; an email is recorded there
//! whether or not it produced a task, so a sender change never replays old
//! mail.

use super::{Poller, PollerCtx};
use crate::channels::EmailMessage;
use crate::error::Result;
use crate::store::{NewTask, SourceType};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

pub struct EmailPoller;

#[async_trait]
impl Poller for EmailPoller {
    fn name(&self) -> &'static str {
        "email"
    }

    fn cadence(&self) -> Duration {
        Duration::from_secs(60)
    }

    async fn tick(&self, ctx: &PollerCtx) -> Result<()> {
        let messages = ctx.channels.email.fetch_new().await?;
        for message in messages {
            if ctx.store.is_email_processed(&message.email_id)? {
                continue;
            }

            let user_id = known_sender(ctx, &message.sender);
            let task_id = match &user_id {
                Some(user_id) => {
                    let mut new = NewTask::prompt(user_id, SourceType::Email, email_prompt(&message));
                    new.attachments = message.attachments.clone();
                    let task_id = ctx.store.create_task(&new, ctx.now)?;
                    debug!(%user_id, email_id = %message.email_id, task_id, "enqueued email task");
                    Some(task_id)
                }
                None => {
                    debug!(sender = %message.sender, email_id = %message.email_id, "ignoring unknown sender");
                    None
                }
            };

            ctx.store.record_processed_email(
                &message.email_id,
                message.message_id.as_deref(),
                message.references.as_deref(),
                &message.sender,
                Some(&message.subject),
                task_id,
                ctx.now,
            )?;
        }
        Ok(())
    }
}

fn known_sender(ctx: &PollerCtx, sender: &str) -> Option<String> {
    let sender = sender.to_lowercase();
    ctx.config
        .users
        .iter()
        .find(|(_, user)| user.email_senders.iter().any(|s| s.to_lowercase() == sender))
        .map(|(user_id, _)| user_id.clone())
}

fn email_prompt(message: &EmailMessage) -> String {
    format!("Subject: {}\n\n{}", message.subject, message.body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::testing::{RecordingPush, ScriptedChat, ScriptedEmail};
    use crate::channels::Channels;
    use crate::config::{Config, UserConfig};
    use crate::store::{Store, TaskFilter};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn ctx_with_email(email: Arc<ScriptedEmail>) -> PollerCtx {
        let mut config = Config::default();
        config.users.insert(
            "alice".to_string(),
            UserConfig {
                email_senders: vec!["Alice@Example.com".to_string()],
                ..Default::default()
            },
        );
        PollerCtx {
            store: Arc::new(Store::open_in_memory().unwrap()),
            config: Arc::new(config),
            channels: Channels {
                chat: Arc::new(ScriptedChat::default()),
                email,
                push: Arc::new(RecordingPush::default()),
            },
            now: Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    fn email(id: &str, sender: &str) -> EmailMessage {
        EmailMessage {
            email_id: id.into(),
            message_id: Some(format!("<{id}@mail>")),
            references: None,
            sender: sender.into(),
            subject: "Receipts".into(),
            body: "Please file these.".into(),
            attachments: vec!["/tmp/receipt.pdf".into()],
        }
    }

    #[tokio::test]
    async fn known_sender_becomes_task_and_dedupes() {
        let scripted = Arc::new(ScriptedEmail::default());
        scripted.inbound.lock().push(email("m1", "alice@example.com"));
        let ctx = ctx_with_email(scripted);

        EmailPoller.tick(&ctx).await.unwrap();
        let tasks = ctx.store.list_tasks(&TaskFilter::default()).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].user_id, "alice");
        assert!(tasks[0].prompt.as_deref().unwrap().starts_with("Subject: Receipts"));
        assert_eq!(tasks[0].attachments, vec!["/tmp/receipt.pdf".to_string()]);

        // Same inbox content on the next tick: nothing new.
        EmailPoller.tick(&ctx).await.unwrap();
        assert_eq!(ctx.store.list_tasks(&TaskFilter::default()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_sender_is_recorded_but_ignored() {
        let scripted = Arc::new(ScriptedEmail::default());
        scripted.inbound.lock().push(email("m2", "stranger@example.com"));
        let ctx = ctx_with_email(scripted);

        EmailPoller.tick(&ctx).await.unwrap();
        assert!(ctx.store.list_tasks(&TaskFilter::default()).unwrap().is_empty());
        assert!(ctx.store.is_email_processed("m2").unwrap());
    }
}
