//! Channel trait — the abstraction over chat platforms.
//!
//! A Channel connects gemcord to a messaging platform (Discord, CLI, ...).
//! It yields inbound events that mention the bot and delivers the reply
//! chunks the dispatcher hands it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;
use crate::media::{MediaBlob, MediaRef};
use crate::message::ConversationId;

/// A message that addressed the bot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    /// The conversation (channel or thread) this message belongs to
    pub conversation_id: ConversationId,

    /// Platform-specific message ID, used to thread the reply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,

    /// Sender identifier (platform-specific user ID)
    pub author_id: String,

    /// Human-readable sender name (if available)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_name: Option<String>,

    /// Message text with the bot mention already removed
    pub text: String,

    /// Files attached to the message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<MediaRef>,

    /// Links the platform surfaced separately from the text (embeds)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<String>,

    /// Text of the message this one replies to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_context: Option<String>,
}

impl InboundEvent {
    pub fn new(
        conversation_id: ConversationId,
        author_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id,
            message_id: None,
            author_id: author_id.into(),
            author_name: None,
            text: text.into(),
            attachments: Vec::new(),
            links: Vec::new(),
            reply_context: None,
        }
    }
}

/// What a single outbound message carries.
#[derive(Debug, Clone)]
pub enum OutboundPayload {
    Text(String),
    Media(MediaBlob),
}

/// One chunk of a reply, addressed to a conversation.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub conversation_id: ConversationId,

    /// The inbound message this replies to
    pub reply_to: Option<String>,

    pub payload: OutboundPayload,
}

impl OutboundMessage {
    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            OutboundPayload::Text(t) => Some(t),
            OutboundPayload::Media(_) => None,
        }
    }
}

/// The core Channel trait.
///
/// Implementations handle platform-specific connection logic, message
/// formatting, rate limiting, and authentication.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Human-readable channel name (e.g., "discord", "cli").
    fn name(&self) -> &str;

    /// Start listening for incoming messages.
    ///
    /// Returns a receiver that yields inbound events. The channel
    /// implementation handles polling or websocket connections internally.
    async fn start(
        &self,
    ) -> std::result::Result<
        tokio::sync::mpsc::Receiver<std::result::Result<InboundEvent, ChannelError>>,
        ChannelError,
    >;

    /// Deliver one outbound message.
    async fn send(&self, message: &OutboundMessage) -> std::result::Result<(), ChannelError>;

    /// Send a typing indicator (if the platform supports it).
    async fn send_typing(
        &self,
        _conversation_id: &ConversationId,
    ) -> std::result::Result<(), ChannelError> {
        Ok(()) // No-op default
    }

    /// Check if a sender is allowed (allowlist check).
    fn is_allowed(&self, author_id: &str) -> bool;

    /// Stop the channel gracefully.
    async fn stop(&self) -> std::result::Result<(), ChannelError> {
        Ok(())
    }

    /// Health check — is the channel connected and operational?
    async fn health_check(&self) -> std::result::Result<bool, ChannelError> {
        Ok(true)
    }
}
