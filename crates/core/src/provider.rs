//! Provider trait — the abstraction over the multimodal model API.
//!
//! A Provider knows how to send a conversation (system prompt, ordered turn
//! history, new user content) to a model and get back a tagged reply: a final
//! answer, a batch of tool-call requests, or a safety block.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::media::MediaBlob;
use crate::message::Turn;
use crate::tool::ToolCall;

/// How aggressively the model API suppresses generated content.
///
/// Variants are declared from most to least restrictive, so the derived
/// ordering is `BlockLowAndAbove < ... < BlockNone`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HarmBlockThreshold {
    BlockLowAndAbove,
    #[default]
    BlockMediumAndAbove,
    BlockOnlyHigh,
    BlockNone,
}

impl HarmBlockThreshold {
    /// Whether content rated `probability` is blocked at this threshold.
    pub fn blocks(self, probability: HarmProbability) -> bool {
        match self {
            HarmBlockThreshold::BlockLowAndAbove => probability >= HarmProbability::Low,
            HarmBlockThreshold::BlockMediumAndAbove => probability >= HarmProbability::Medium,
            HarmBlockThreshold::BlockOnlyHigh => probability >= HarmProbability::High,
            HarmBlockThreshold::BlockNone => false,
        }
    }

    /// The wire name used by the model API.
    pub fn as_api_str(self) -> &'static str {
        match self {
            HarmBlockThreshold::BlockLowAndAbove => "BLOCK_LOW_AND_ABOVE",
            HarmBlockThreshold::BlockMediumAndAbove => "BLOCK_MEDIUM_AND_ABOVE",
            HarmBlockThreshold::BlockOnlyHigh => "BLOCK_ONLY_HIGH",
            HarmBlockThreshold::BlockNone => "BLOCK_NONE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HarmProbability {
    Negligible,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HarmCategory {
    #[serde(rename = "HARM_CATEGORY_HARASSMENT")]
    Harassment,
    #[serde(rename = "HARM_CATEGORY_HATE_SPEECH")]
    HateSpeech,
    #[serde(rename = "HARM_CATEGORY_SEXUALLY_EXPLICIT")]
    SexuallyExplicit,
    #[serde(rename = "HARM_CATEGORY_DANGEROUS_CONTENT")]
    DangerousContent,
    #[serde(rename = "HARM_CATEGORY_CIVIC_INTEGRITY")]
    CivicIntegrity,
}

impl HarmCategory {
    pub const ALL: [HarmCategory; 5] = [
        HarmCategory::CivicIntegrity,
        HarmCategory::DangerousContent,
        HarmCategory::Harassment,
        HarmCategory::HateSpeech,
        HarmCategory::SexuallyExplicit,
    ];

    pub fn pretty_name(self) -> &'static str {
        match self {
            HarmCategory::Harassment => "Harassment",
            HarmCategory::HateSpeech => "Hate Speech",
            HarmCategory::SexuallyExplicit => "Sexually Explicit",
            HarmCategory::DangerousContent => "Dangerous Content",
            HarmCategory::CivicIntegrity => "Civic Integrity",
        }
    }
}

/// A per-category safety rating attached to a model response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyRating {
    pub category: HarmCategory,
    pub probability: HarmProbability,
}

/// Pretty names of the categories that `threshold` blocks in `ratings`.
pub fn blocked_categories(ratings: &[SafetyRating], threshold: HarmBlockThreshold) -> Vec<String> {
    ratings
        .iter()
        .filter(|r| threshold.blocks(r.probability))
        .map(|r| r.category.pretty_name().to_string())
        .collect()
}

/// A tool definition sent to the model so it knows what tools it can call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// One request to the model.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    /// The model to use (e.g., "gemini-2.5-flash")
    pub model: String,

    /// System instructions, if any
    pub system_prompt: Option<String>,

    /// Committed session history, oldest first
    pub history: Vec<Turn>,

    /// Turns of the in-flight exchange: the new user turn, followed by any
    /// tool-call / tool-result turns from earlier hops of this exchange
    pub new_turns: Vec<Turn>,

    /// Tools the model may call
    pub tools: Vec<ToolDefinition>,

    /// Safety threshold applied to every harm category
    pub safety_threshold: HarmBlockThreshold,

    /// Sampling temperature
    pub temperature: f32,
}

impl ModelRequest {
    /// History and in-flight turns, in the order the model sees them.
    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.history.iter().chain(self.new_turns.iter())
    }
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// The tagged content of a model response.
#[derive(Debug, Clone)]
pub enum ModelReply {
    /// The answer to show the user.
    Final {
        text: String,
        media: Vec<MediaBlob>,
        /// The answer hit the output token limit
        truncated: bool,
    },

    /// The model wants one or more tools invoked before it answers.
    ToolCalls {
        /// Any text emitted alongside the calls
        text: String,
        calls: Vec<ToolCall>,
    },

    /// The model API withheld the response under the configured threshold.
    Blocked { ratings: Vec<SafetyRating> },
}

/// A complete response from a provider.
#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub reply: ModelReply,

    /// Token usage statistics
    pub usage: Option<Usage>,

    /// Which model actually responded (may differ from requested)
    pub model: String,
}

/// The core Provider trait.
///
/// The orchestrator calls `complete()` without knowing which backend is used.
/// Implementations report transport failures as [`ModelError`] and content
/// blocks as [`ModelReply::Blocked`].
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "gemini").
    fn name(&self) -> &str;

    /// Send a request and get a complete response.
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, ModelError>;

    /// Health check — can we reach the provider?
    async fn health_check(&self) -> Result<bool, ModelError> {
        Ok(true)
    }
}
