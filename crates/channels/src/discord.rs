//! Discord channel adapter (stub).
//!
//! Implements the Channel trait for the Discord Bot API. The gateway
//! connection is not wired up yet; messages are injected in-process, which
//! is how the dispatcher is exercised end to end.

use async_trait::async_trait;
use gemcord_config::DiscordConfig;
use gemcord_core::channel::{Channel, InboundEvent, OutboundMessage, OutboundPayload};
use gemcord_core::error::ChannelError;
use gemcord_core::message::ConversationId;
use regex::Regex;
use std::sync::LazyLock;
use tokio::sync::mpsc;
use tracing::{info, warn};

static MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<@!?\d+>").expect("mention pattern is valid"));

/// Remove user mentions (`<@123>`, `<@!123>`) from message content.
pub fn strip_mentions(content: &str) -> String {
    MENTION.replace_all(content, "").trim().to_string()
}

/// Discord channel adapter.
pub struct DiscordChannel {
    config: DiscordConfig,
    inject_tx: tokio::sync::Mutex<Option<mpsc::Sender<Result<InboundEvent, ChannelError>>>>,
}

impl DiscordChannel {
    pub fn new(config: DiscordConfig) -> Self {
        Self {
            config,
            inject_tx: tokio::sync::Mutex::new(None),
        }
    }

    /// Inject a message as if it came from Discord. The bot mention is stripped.
    pub async fn inject_message(&self, mut event: InboundEvent) -> Result<(), ChannelError> {
        event.text = strip_mentions(&event.text);
        let guard = self.inject_tx.lock().await;
        if let Some(tx) = guard.as_ref() {
            tx.send(Ok(event))
                .await
                .map_err(|_| ChannelError::ConnectionLost("Message channel closed".into()))
        } else {
            Err(ChannelError::ConnectionLost("Channel not started".into()))
        }
    }

    /// Close the inbound stream.
    pub async fn disconnect(&self) {
        *self.inject_tx.lock().await = None;
    }
}

#[async_trait]
impl Channel for DiscordChannel {
    fn name(&self) -> &str {
        "discord"
    }

    async fn start(
        &self,
    ) -> Result<mpsc::Receiver<Result<InboundEvent, ChannelError>>, ChannelError> {
        if self.config.bot_token.as_deref().is_none_or(str::is_empty) {
            return Err(ChannelError::NotConfigured("discord.bot_token is not set".into()));
        }
        warn!("Discord channel has no gateway connection; only injected messages will arrive");
        let (tx, rx) = mpsc::channel(64);
        *self.inject_tx.lock().await = Some(tx);
        Ok(rx)
    }

    async fn send(&self, message: &OutboundMessage) -> Result<(), ChannelError> {
        match &message.payload {
            OutboundPayload::Text(text) => info!(
                chat_id = %message.conversation_id,
                reply_to = ?message.reply_to,
                content_len = text.chars().count(),
                "Discord send (stub)"
            ),
            OutboundPayload::Media(blob) => info!(
                chat_id = %message.conversation_id,
                mime_type = %blob.mime_type(),
                bytes = blob.len(),
                "Discord file upload (stub)"
            ),
        }
        Ok(())
    }

    async fn send_typing(&self, conversation_id: &ConversationId) -> Result<(), ChannelError> {
        info!(chat_id = %conversation_id, "Discord typing (stub)");
        Ok(())
    }

    fn is_allowed(&self, author_id: &str) -> bool {
        if self.config.allowed_users.is_empty() {
            return true;
        }
        self.config
            .allowed_users
            .iter()
            .any(|u| u == "*" || u == author_id)
    }

    async fn stop(&self) -> Result<(), ChannelError> {
        info!("Discord channel stopping");
        self.disconnect().await;
        Ok(())
    }

    async fn health_check(&self) -> Result<bool, ChannelError> {
        Ok(self.config.bot_token.as_deref().is_some_and(|t| !t.is_empty()))
    }
}
