//! Delivery router: results go back through the originating channel
//!
//! The target comes from the task's explicit `output_target`, else is
//! inferred from its source type. Compound targets fan out to several
//! sinks. Delivery is strictly best-effort: a failed send is logged and
//! the task stays in its terminal state.

use crate::channels::{Channels, ThreadHeaders};
use crate::config::Config;
use crate::store::{OutputTarget, SourceType, Store, Task};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Results with this prefix report that nothing needed doing.
const NO_ACTION_PREFIX: &str = "NO_ACTION:";
/// Results with this prefix are always delivered, silent mode or not.
const ACTION_PREFIX: &str = "ACTION:";

pub struct DeliveryRouter {
    channels: Channels,
    store: Arc<Store>,
    config: Arc<Config>,
}

impl DeliveryRouter {
    pub fn new(channels: Channels, store: Arc<Store>, config: Arc<Config>) -> Self {
        Self { channels, store, config }
    }

    /// Deliver `body` for `task` to every resolved sink. Never fails the
    /// task; sink errors are logged and swallowed.
    pub async fn deliver(&self, task: &Task, body: &str) {
        let (body, suppressed) = apply_silent_policy(task, body);
        if suppressed {
            debug!(task_id = task.id, "silent task with NO_ACTION result; suppressing delivery");
            return;
        }
        let body = body.trim();
        if body.is_empty() {
            debug!(task_id = task.id, "empty result; nothing to deliver");
            return;
        }

        let Some(target) = resolve_target(task) else {
            debug!(task_id = task.id, source = %task.source_type, "no delivery target");
            return;
        };

        for sink in target.sinks() {
            let outcome = match sink {
                OutputTarget::Chat => self.deliver_chat(task, body).await,
                OutputTarget::Email => self.deliver_email(task, body).await,
                OutputTarget::Push => self.deliver_push(task, body).await,
                _ => unreachable!("sinks() yields only primitive targets"),
            };
            if let Err(err) = outcome {
                warn!(task_id = task.id, sink = %sink, %err, "delivery failed");
            } else {
                info!(task_id = task.id, sink = %sink, "delivered result");
            }
        }
    }

    async fn deliver_chat(&self, task: &Task, body: &str) -> crate::error::Result<()> {
        let token = task.conversation_token.as_deref().ok_or_else(|| {
            crate::error::IstotaError::DeliveryFailed {
                channel: "chat".into(),
                message: "task has no conversation token".into(),
            }
        })?;
        let response_id = self
            .channels
            .chat
            .post_reply(token, body, task.reply_to_talk_id.as_deref())
            .await?;
        let _ = self.store.set_talk_response_id(task.id, &response_id);
        Ok(())
    }

    async fn deliver_email(&self, task: &Task, body: &str) -> crate::error::Result<()> {
        // Reply into the thread the task came from when we have one.
        let origin = self.store.email_for_task(task.id)?;
        let (to, subject, thread) = match &origin {
            Some(email) => {
                let subject = match &email.subject {
                    Some(subject) if subject.to_lowercase().starts_with("re:") => subject.clone(),
                    Some(subject) => format!("Re: {subject}"),
                    None => "Re: your request".to_string(),
                };
                let thread = email.message_id.as_ref().map(|message_id| ThreadHeaders {
                    in_reply_to: message_id.clone(),
                    references: match &email.references_header {
                        Some(refs) => format!("{refs} {message_id}"),
                        None => message_id.clone(),
                    },
                });
                (email.sender.clone(), subject, thread)
            }
            None => {
                let to = self
                    .config
                    .users
                    .get(&task.user_id)
                    .and_then(|u| u.email_senders.first().cloned())
                    .ok_or_else(|| crate::error::IstotaError::DeliveryFailed {
                        channel: "email".into(),
                        message: format!("no email address known for {}", task.user_id),
                    })?;
                (to, format!("Assistant update (task {})", task.id), None)
            }
        };

        self.channels.email.send(&to, &subject, body, thread.as_ref()).await?;
        Ok(())
    }

    async fn deliver_push(&self, task: &Task, body: &str) -> crate::error::Result<()> {
        // Push is for glanceable alerts; keep it short.
        let short: String = body.chars().take(500).collect();
        self.channels
            .push
            .notify(&task.user_id, "istota", &short, self.config.channels.push.priority)
            .await
    }
}

/// Explicit target first, then the source type's natural channel.
fn resolve_target(task: &Task) -> Option<OutputTarget> {
    if let Some(target) = task.output_target {
        return Some(target);
    }
    match task.source_type {
        SourceType::Chat => Some(OutputTarget::Chat),
        SourceType::Email => Some(OutputTarget::Email),
        SourceType::Scheduled | SourceType::Briefing | SourceType::Subtask | SourceType::File => {
            Some(OutputTarget::Chat)
        }
        // run-once prints CLI results itself.
        SourceType::Cli => None,
    }
}

/// NO_ACTION results are suppressed on every sink when the task runs in
/// silent mode; ACTION results always go out. Prefixes are stripped either
/// way.
fn apply_silent_policy<'a>(task: &Task, body: &'a str) -> (&'a str, bool) {
    if let Some(rest) = body.strip_prefix(NO_ACTION_PREFIX) {
        return (rest.trim(), task.heartbeat_silent);
    }
    if let Some(rest) = body.strip_prefix(ACTION_PREFIX) {
        return (rest.trim(), false);
    }
    (body, false)
}
