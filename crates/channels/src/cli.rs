//! CLI channel — interactive terminal-based chat.
//!
//! This is the simplest channel: reads from stdin, writes to stdout.
//! Used for `gemcord run --channel cli` and `gemcord chat`.
//!
//! Words of the form `@path/to/file` attach that local file to the message.

use async_trait::async_trait;
use gemcord_core::channel::{Channel, InboundEvent, OutboundMessage, OutboundPayload};
use gemcord_core::error::ChannelError;
use gemcord_core::media::MediaRef;
use gemcord_core::message::ConversationId;
use std::path::Path;
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

pub const CLI_CONVERSATION: &str = "cli";
pub const CLI_USER: &str = "local_user";

/// Interactive CLI channel for terminal-based chat.
#[derive(Debug, Default)]
pub struct CliChannel;

impl CliChannel {
    pub fn new() -> Self {
        Self
    }

    /// Turn one input line into an inbound event.
    pub fn event_from_line(line: &str) -> InboundEvent {
        let mut words = Vec::new();
        let mut attachments = Vec::new();

        for word in line.split_whitespace() {
            match word.strip_prefix('@').filter(|p| !p.is_empty()) {
                Some(path) => attachments.push(file_attachment(path)),
                None => words.push(word),
            }
        }

        let mut event = InboundEvent::new(
            ConversationId::from(CLI_CONVERSATION),
            CLI_USER,
            words.join(" "),
        );
        event.author_name = Some("User".into());
        event.attachments = attachments;
        event
    }
}

fn file_attachment(path: &str) -> MediaRef {
    let path = Path::new(path);
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    MediaRef::Attachment {
        url: format!("file://{}", absolute.display()),
        filename: path.file_name().map(|n| n.to_string_lossy().into_owned()),
        mime_type: None,
        size_bytes: std::fs::metadata(&absolute).ok().map(|m| m.len()),
    }
}

/// How a payload is shown in the terminal.
pub fn render(payload: &OutboundPayload) -> String {
    match payload {
        OutboundPayload::Text(text) => text.clone(),
        OutboundPayload::Media(blob) => format!(
            "[{} attachment, {} bytes, from {}]",
            blob.mime_type(),
            blob.len(),
            blob.source()
        ),
    }
}

#[async_trait]
impl Channel for CliChannel {
    fn name(&self) -> &str {
        "cli"
    }

    async fn start(
        &self,
    ) -> Result<mpsc::Receiver<Result<InboundEvent, ChannelError>>, ChannelError> {
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            let stdin = io::stdin();
            let reader = BufReader::new(stdin);
            let mut lines = reader.lines();

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim().to_string();
                        if line.is_empty() {
                            continue;
                        }

                        // Check for exit commands
                        if matches!(line.as_str(), "exit" | "quit" | "/exit" | "/quit" | ":q") {
                            break;
                        }

                        if tx.send(Ok(CliChannel::event_from_line(&line))).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break, // EOF (Ctrl+D)
                    Err(e) => {
                        let _ = tx.send(Err(ChannelError::ConnectionLost(e.to_string()))).await;
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn send(&self, message: &OutboundMessage) -> Result<(), ChannelError> {
        println!("{}", render(&message.payload));
        Ok(())
    }

    fn is_allowed(&self, _author_id: &str) -> bool {
        true // CLI is always allowed (local user)
    }
}
