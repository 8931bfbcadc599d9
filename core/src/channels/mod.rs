//! Inbound/outbound channel seams
//!
//! The core is transport-agnostic: chat, email and push are collaborators
//! reached through these traits. Real adapters (long-polling chat client,
//! IMAP/SMTP, push gateways) live outside the core; the daemon wires in
//! whatever the configuration enables, and everything else gets a null
//! implementation.

use crate::error::{IstotaError, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// One inbound chat message
#[derive(Debug, Clone)]
pub struct ChatMessage {
    /// Monotonic message id within the room; the poller's cursor
    pub id: i64,
    pub sender: String,
    pub text: String,
    /// Sent by the bot's own account
    pub is_bot: bool,
    /// The bot was @mentioned
    pub mentions_me: bool,
    /// One-on-one conversation (mentions not required)
    pub is_direct: bool,
}

#[async_trait]
pub trait ChatChannel: Send + Sync {
    /// Messages in `token` with id greater than `after`, oldest first.
    async fn fetch_new(&self, token: &str, after: Option<i64>) -> Result<Vec<ChatMessage>>;

    /// Post `text` into `token`, optionally threading on a message id.
    /// Returns the delivery id.
    async fn post_reply(&self, token: &str, text: &str, reply_to: Option<&str>) -> Result<String>;
}

/// One inbound email
#[derive(Debug, Clone)]
pub struct EmailMessage {
    /// Provider-unique id; the dedup key
    pub email_id: String,
    /// RFC 5322 Message-ID, kept for reply threading
    pub message_id: Option<String>,
    pub references: Option<String>,
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<String>,
}

/// Headers that keep a reply in its thread
#[derive(Debug, Clone)]
pub struct ThreadHeaders {
    pub in_reply_to: String,
    pub references: String,
}

#[async_trait]
pub trait EmailChannel: Send + Sync {
    async fn fetch_new(&self) -> Result<Vec<EmailMessage>>;

    /// Returns the sent Message-ID.
    async fn send(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        thread: Option<&ThreadHeaders>,
    ) -> Result<String>;
}

#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn notify(&self, user_id: &str, title: &str, body: &str, priority: u8) -> Result<()>;
}

/// The channel set handed to pollers and the delivery router.
#[derive(Clone)]
pub struct Channels {
    pub chat: Arc<dyn ChatChannel>,
    pub email: Arc<dyn EmailChannel>,
    pub push: Arc<dyn PushChannel>,
}

impl Channels {
    /// Every channel disabled; fetches return nothing, deliveries fail.
    pub fn disabled() -> Self {
        Self {
            chat: Arc::new(NullChannel),
            email: Arc::new(NullChannel),
            push: Arc::new(NullChannel),
        }
    }
}

/// Stand-in for channels the configuration leaves disabled.
pub struct NullChannel;

#[async_trait]
impl ChatChannel for NullChannel {
    async fn fetch_new(&self, _token: &str, _after: Option<i64>) -> Result<Vec<ChatMessage>> {
        Ok(Vec::new())
    }

    async fn post_reply(&self, _token: &str, _text: &str, _reply_to: Option<&str>) -> Result<String> {
        Err(IstotaError::DeliveryFailed {
            channel: "chat".into(),
            message: "chat channel is disabled".into(),
        })
    }
}

#[async_trait]
impl EmailChannel for NullChannel {
    async fn fetch_new(&self) -> Result<Vec<EmailMessage>> {
        Ok(Vec::new())
    }

    async fn send(
        &self,
        _to: &str,
        _subject: &str,
        _body: &str,
        _thread: Option<&ThreadHeaders>,
    ) -> Result<String> {
        Err(IstotaError::DeliveryFailed {
            channel: "email".into(),
            message: "email channel is disabled".into(),
        })
    }
}

#[async_trait]
impl PushChannel for NullChannel {
    async fn notify(&self, _user_id: &str, _title: &str, _body: &str, _priority: u8) -> Result<()> {
        Err(IstotaError::DeliveryFailed {
            channel: "push".into(),
            message: "push channel is disabled".into(),
        })
    }
}
