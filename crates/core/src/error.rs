//! Error types for the gemcord domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; the top-level [`Error`]
//! adds the turn-level outcomes that only the orchestrator produces.

use thiserror::Error;

/// The top-level error type for all gemcord operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Media errors ---
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Model errors ---
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    // --- Channel errors ---
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    // --- Turn-level outcomes ---
    #[error("Tool loop exceeded the cap of {cap} round-trips")]
    ToolLoopExceeded {
        cap: u32,
        /// Best answer the model gave without further tools, if any
        partial: Option<String>,
    },

    #[error("Turn cancelled")]
    Cancelled,

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The single explanatory reply shown in the conversation when a turn
    /// terminates with this error.
    pub fn user_notice(&self) -> String {
        match self {
            Error::Media(MediaError::Cancelled) | Error::Cancelled => "Stopped.".into(),
            Error::Media(MediaError::UnsupportedFormat { mime_type, .. }) => format!(
                "Sorry, I can't read files of type `{mime_type}`. Nothing from this message was saved."
            ),
            Error::Media(e @ MediaError::Download { .. }) => format!(
                "Error: Failed to fetch attachment(s). {e}\nNothing from this message was saved, feel free to try again."
            ),
            Error::Model(ModelError::Blocked { categories }) => {
                let reason = if categories.is_empty() {
                    "a safety policy".to_string()
                } else {
                    categories.join(", ")
                };
                format!("This response was blocked due to {reason}")
            }
            Error::Model(ModelError::Malformed(_)) => {
                "Seems like my function calling tool is malformed. Try again!".into()
            }
            Error::Model(e) => format!(
                "Something went wrong on the model's end. Please wait for a while and try again.\n```{e}```"
            ),
            Error::ToolLoopExceeded { cap, partial: Some(partial) } => format!(
                "{partial}\n\n(I stopped after {cap} tool calls, so this answer may be incomplete.)"
            ),
            Error::ToolLoopExceeded { cap, partial: None } => format!(
                "I stopped after {cap} tool calls without reaching an answer. Try rephrasing or narrowing the question."
            ),
            Error::Tool(e) => format!("A tool failed while answering: {e}"),
            other => format!(
                "Something went wrong. Please review the error and maybe submit a bug report.\n```{other}```"
            ),
        }
    }
}

// --- Bounded context errors ---

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("Download failed for {source_ref}: {reason}")]
    Download { source_ref: String, reason: String },

    #[error("Unsupported media type {mime_type} for {source_ref}")]
    UnsupportedFormat { source_ref: String, mime_type: String },

    #[error("Media resolution cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Arguments for {tool_name} do not match its schema: {reason}")]
    SchemaMismatch { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("Tool execution failed: {tool_name}: {reason}")]
    Failed { tool_name: String, reason: String },
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Memory storage failed: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("API request failed: {message} (status: {status_code})")]
    Api { status_code: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Model request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Response blocked by safety filter")]
    Blocked { categories: Vec<String> },

    #[error("Malformed model response: {0}")]
    Malformed(String),

    #[error("Media upload failed: {0}")]
    Upload(String),
}

impl ModelError {
    /// Transport-level failures are worth one more attempt; content-level
    /// outcomes (blocked, malformed) and client errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ModelError::Network(_) | ModelError::Timeout { .. } => true,
            ModelError::Api { status_code, .. } => *status_code == 429 || *status_code >= 500,
            ModelError::Blocked { .. } | ModelError::Malformed(_) | ModelError::Upload(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel not configured: {0}")]
    NotConfigured(String),

    #[error("Message delivery failed to {channel}: {reason}")]
    DeliveryFailed { channel: String, reason: String },

    #[error("Channel connection lost: {0}")]
    ConnectionLost(String),
}
