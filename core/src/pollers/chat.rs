//! Chat poller: new inbound messages become foreground tasks
//!
//! One cursor per conversation token. The bot's own messages never become
//! tasks but still advance the cursor; in multi-party rooms only mentions
//! do.

use super::{Poller, PollerCtx};
use crate::error::Result;
use crate::store::{NewTask, SourceType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

pub struct ChatPoller;

#[derive(Debug, Default, Serialize, Deserialize)]
struct ChatCursor {
    last_message_id: Option<i64>,
    #[serde(default)]
    consecutive_errors: u32,
}

#[async_trait]
impl Poller for ChatPoller {
    fn name(&self) -> &'static str {
        "chat"
    }

    fn cadence(&self) -> Duration {
        Duration::from_secs(10)
    }

    async fn tick(&self, ctx: &PollerCtx) -> Result<()> {
        for (user_id, user) in &ctx.config.users {
            for token in &user.chat_tokens {
                if let Err(err) = poll_token(ctx, user_id, token).await {
                    warn!(%user_id, %token, %err, "chat poll failed");
                    let mut cursor: ChatCursor =
                        ctx.store.get_poller_state("chat", token)?.unwrap_or_default();
                    cursor.consecutive_errors += 1;
                    ctx.store.put_poller_state("chat", token, &cursor, ctx.now)?;
                }
            }
        }
        Ok(())
    }
}

async fn poll_token(ctx: &PollerCtx, user_id: &str, token: &str) -> Result<()> {
    let cursor: ChatCursor = ctx.store.get_poller_state("chat", token)?.unwrap_or_default();

    let messages = ctx.channels.chat.fetch_new(token, cursor.last_message_id).await?;
    if messages.is_empty() {
        return Ok(());
    }

    let mut last_seen = cursor.last_message_id;
    for message in &messages {
        last_seen = Some(last_seen.map_or(message.id, |prev| prev.max(message.id)));

        if message.is_bot {
            continue;
        }
        if !message.is_direct && !message.mentions_me {
            continue;
        }

        // A reply on a conversation holding a parked confirmation answers
        // the confirmation instead of opening new work.
        if let Some(parked) = ctx.store.pending_confirmation_for(user_id, token)? {
            match classify_reply(&message.text) {
                Reply::Affirmative => {
                    ctx.store.confirm_task(parked.id, ctx.now)?;
                    debug!(%user_id, %token, task_id = parked.id, "confirmation accepted");
                    continue;
                }
                Reply::Negative => {
                    ctx.store.cancel_task(parked.id, ctx.now)?;
                    debug!(%user_id, %token, task_id = parked.id, "confirmation declined");
                    continue;
                }
                Reply::Other => {}
            }
        }

        let mut new = NewTask::prompt(user_id, SourceType::Chat, &message.text);
        new.conversation_token = Some(token.to_string());
        new.talk_message_id = Some(message.id.to_string());
        new.reply_to_talk_id = Some(message.id.to_string());
        new.reply_to_content = Some(message.text.clone());
        let task_id = ctx.store.create_task(&new, ctx.now)?;
        debug!(%user_id, %token, message_id = message.id, task_id, "enqueued chat task");
    }

    ctx.store.put_poller_state(
        "chat",
        token,
        &ChatCursor { last_message_id: last_seen, consecutive_errors: 0 },
        ctx.now,
    )?;
    Ok(())
}

enum Reply {
    Affirmative,
    Negative,
    Other,
}

fn classify_reply(text: &str) -> Reply {
    match text.trim().trim_end_matches(['.', '!']).to_lowercase().as_str() {
        "yes" | "y" | "ok" | "okay" | "confirm" | "confirmed" | "do it" | "go ahead" => {
            Reply::Affirmative
        }
        "no" | "n" | "cancel" | "stop" | "don't" | "abort" => Reply::Negative,
        _ => Reply::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::testing::{RecordingPush, ScriptedChat, ScriptedEmail};
    use crate::channels::{ChatMessage, Channels};
    use crate::config::{Config, UserConfig};
    use crate::store::{Store, TaskFilter};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn ctx_with_chat(chat: Arc<ScriptedChat>) -> PollerCtx {
        let mut config = Config::default();
        config.users.insert(
            "alice".to_string(),
            UserConfig { chat_tokens: vec!["room-1".to_string()], ..Default::default() },
        );
        PollerCtx {
            store: Arc::new(Store::open_in_memory().unwrap()),
            config: Arc::new(config),
            channels: Channels {
                chat,
                email: Arc::new(ScriptedEmail::default()),
                push: Arc::new(RecordingPush::default()),
            },
            now: Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    fn message(id: i64, text: &str) -> ChatMessage {
        ChatMessage {
            id,
            sender: "alice".into(),
            text: text.into(),
            is_bot: false,
            mentions_me: false,
            is_direct: true,
        }
    }

    #[tokio::test]
    async fn new_messages_become_tasks_once() {
        let chat = Arc::new(ScriptedChat::default());
        chat.push_inbound("room-1", message(1, "hello"));
        chat.push_inbound("room-1", message(2, "world"));
        let ctx = ctx_with_chat(chat.clone());

        ChatPoller.tick(&ctx).await.unwrap();
        let tasks = ctx.store.list_tasks(&TaskFilter::default()).unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.conversation_token.as_deref() == Some("room-1")));

        // Replaying the tick with the advanced cursor is a no-op.
        ChatPoller.tick(&ctx).await.unwrap();
        assert_eq!(ctx.store.list_tasks(&TaskFilter::default()).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn confirmation_replies_resolve_the_parked_task() {
        let chat = Arc::new(ScriptedChat::default());
        let ctx = ctx_with_chat(chat.clone());

        // Park a task waiting on confirmation in the same conversation.
        let mut new =
            crate::store::NewTask::prompt("alice", SourceType::Chat, "book the flight");
        new.conversation_token = Some("room-1".into());
        let parked = ctx.store.create_task(&new, ctx.now).unwrap();
        ctx.store
            .claim_task("w", None, None, chrono::Duration::hours(1), ctx.now)
            .unwrap();
        ctx.store.mark_running(parked, None, ctx.now).unwrap();
        ctx.store.set_confirmation(parked, "Spend $420?", ctx.now).unwrap();

        chat.push_inbound("room-1", message(1, "yes!"));
        ChatPoller.tick(&ctx).await.unwrap();

        let task = ctx.store.get_task(parked).unwrap().unwrap();
        assert_eq!(task.status, crate::store::TaskStatus::Pending);
        // The reply answered the confirmation; it did not become a task.
        let all = ctx.store.list_tasks(&TaskFilter::default()).unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn negative_reply_cancels_the_parked_task() {
        let chat = Arc::new(ScriptedChat::default());
        let ctx = ctx_with_chat(chat.clone());

        let mut new = crate::store::NewTask::prompt("alice", SourceType::Chat, "buy it");
        new.conversation_token = Some("room-1".into());
        let parked = ctx.store.create_task(&new, ctx.now).unwrap();
        ctx.store
            .claim_task("w", None, None, chrono::Duration::hours(1), ctx.now)
            .unwrap();
        ctx.store.mark_running(parked, None, ctx.now).unwrap();
        ctx.store.set_confirmation(parked, "Spend $420?", ctx.now).unwrap();

        chat.push_inbound("room-1", message(1, "no"));
        ChatPoller.tick(&ctx).await.unwrap();

        let task = ctx.store.get_task(parked).unwrap().unwrap();
        assert_eq!(task.status, crate::store::TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn bot_and_unmentioned_room_messages_are_skipped() {
        let chat = Arc::new(ScriptedChat::default());
        let mut own = message(1, "my own reply");
        own.is_bot = true;
        chat.push_inbound("room-1", own);

        let mut unmentioned = message(2, "chatter");
        unmentioned.is_direct = false;
        chat.push_inbound("room-1", unmentioned);

        let mut mentioned = message(3, "@istota do the thing");
        mentioned.is_direct = false;
        mentioned.mentions_me = true;
        chat.push_inbound("room-1", mentioned);

        let ctx = ctx_with_chat(chat);
        ChatPoller.tick(&ctx).await.unwrap();

        let tasks = ctx.store.list_tasks(&TaskFilter::default()).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].prompt.as_deref(), Some("@istota do the thing"));
        // Skipped messages still advanced the cursor.
        ChatPoller.tick(&ctx).await.unwrap();
        assert_eq!(ctx.store.list_tasks(&TaskFilter::default()).unwrap().len(), 1);
    }
}
