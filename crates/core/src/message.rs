//! Conversation and Turn domain types.
//!
//! These are the core value objects that flow through the entire system:
//! User sends a message → Channel receives it → Orchestrator builds turns →
//! Provider answers → turns are committed to the session history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::media::MediaBlob;
use crate::tool::{ToolCall, ToolOutcome};

/// Unique identifier for a conversation (a chat channel or thread).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One atomic contribution to a conversation.
///
/// Turns are immutable once appended to a session.
#[derive(Debug, Clone)]
pub enum Turn {
    User(UserTurn),
    Model(ModelTurn),
    ToolResult(ToolResultTurn),
}

impl Turn {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Turn::User(t) => t.timestamp,
            Turn::Model(t) => t.timestamp,
            Turn::ToolResult(t) => t.timestamp,
        }
    }

    pub fn is_user(&self) -> bool {
        matches!(self, Turn::User(_))
    }
}

/// A message from a human, with any media resolved for it.
#[derive(Debug, Clone)]
pub struct UserTurn {
    /// Platform user ID of the author
    pub author_id: String,

    /// Display name of the author, if known
    pub author_name: Option<String>,

    /// The text content, with video links already stripped out
    pub text: String,

    /// Media resolved from attachments and links
    pub media: Vec<MediaBlob>,

    /// Text of the message being replied to, if any
    pub reply_context: Option<String>,

    /// Saved long-term memory, attached to the first turn of a conversation
    pub memory: Option<String>,

    pub timestamp: DateTime<Utc>,
}

impl UserTurn {
    pub fn new(author_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            author_id: author_id.into(),
            author_name: None,
            text: text.into(),
            media: Vec::new(),
            reply_context: None,
            memory: None,
            timestamp: Utc::now(),
        }
    }

    /// Render the text the model sees: saved memory, timestamp, author,
    /// optional reply context.
    pub fn prompt_text(&self) -> String {
        let when = self.timestamp.format("%A, %B %d, %Y %H:%M:%S UTC");
        let name = self.author_name.as_deref().unwrap_or(&self.author_id);
        let memory = match &self.memory {
            Some(memory) => format!("This is the memory you saved: {memory}\n\n"),
            None => String::new(),
        };
        let line = match &self.reply_context {
            Some(replied) => format!(
                "{when}, {name} with ID {} replied to your message, \"{replied}\": {}",
                self.author_id, self.text
            ),
            None => format!("{when}, {name} with ID {}: {}", self.author_id, self.text),
        };
        format!("{memory}{line}")
    }
}

/// A model response: either an intermediate step that requested tools or the
/// final answer of a turn.
#[derive(Debug, Clone)]
pub struct ModelTurn {
    pub text: String,

    /// Tool calls the model requested in this response (empty for a final answer)
    pub tool_calls: Vec<ToolCall>,

    /// Media generated by the model
    pub media: Vec<MediaBlob>,

    pub timestamp: DateTime<Utc>,
}

impl ModelTurn {
    pub fn answer(text: impl Into<String>, media: Vec<MediaBlob>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
            media,
            timestamp: Utc::now(),
        }
    }

    pub fn with_calls(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            text: text.into(),
            tool_calls,
            media: Vec::new(),
            timestamp: Utc::now(),
        }
    }
}

/// The outcome of one tool invocation, fed back to the model.
#[derive(Debug, Clone)]
pub struct ToolResultTurn {
    /// The call this result answers
    pub call_id: String,

    pub tool_name: String,

    pub outcome: ToolOutcome,

    pub timestamp: DateTime<Utc>,
}

impl ToolResultTurn {
    pub fn new(call: &ToolCall, outcome: ToolOutcome) -> Self {
        Self {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            outcome,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn prompt_text_includes_author_and_time() {
        let mut turn = UserTurn::new("42", "What is 12*7?");
        turn.author_name = Some("alice".into());
        turn.timestamp = Utc.with_ymd_and_hms(2025, 1, 6, 9, 30, 0).unwrap();
        assert_eq!(
            turn.prompt_text(),
            "Monday, January 06, 2025 09:30:00 UTC, alice with ID 42: What is 12*7?"
        );
    }

    #[test]
    fn prompt_text_mentions_replied_message() {
        let mut turn = UserTurn::new("42", "why?");
        turn.reply_context = Some("The sky is blue.".into());
        let text = turn.prompt_text();
        assert!(text.contains("replied to your message, \"The sky is blue.\""));
        assert!(text.ends_with(": why?"));
    }

    #[test]
    fn prompt_text_leads_with_saved_memory() {
        let mut turn = UserTurn::new("42", "hi");
        turn.memory = Some("alice likes tea".into());
        let text = turn.prompt_text();
        assert!(text.starts_with("This is the memory you saved: alice likes tea\n\n"));
        assert!(text.ends_with("with ID 42: hi"));
    }

    #[test]
    fn tool_result_turn_copies_call_identity() {
        let call = ToolCall {
            id: "call_1".into(),
            name: "symbolic_math".into(),
            arguments: serde_json::json!({"expression": "1+1"}),
        };
        let turn = ToolResultTurn::new(&call, ToolOutcome::Success(serde_json::json!({"result": 2})));
        assert_eq!(turn.call_id, "call_1");
        assert_eq!(turn.tool_name, "symbolic_math");
        assert!(Turn::ToolResult(turn).timestamp() <= Utc::now());
    }
}
