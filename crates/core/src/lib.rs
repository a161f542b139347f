//! # gemcord Core
//!
//! Domain types, traits, and error definitions for the gemcord chat bridge.
//! This crate has **zero framework dependencies** — it defines the domain model
//! that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator (model API, tool API, chat platform) is defined
//! as a trait here. Implementations live in their respective crates. This enables:
//! - Swapping implementations via configuration
//! - Easy testing with scripted/stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod error;
pub mod message;
pub mod media;
pub mod provider;
pub mod channel;
pub mod tool;
pub mod event;
pub mod memory;

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use message::{ConversationId, ModelTurn, ToolResultTurn, Turn, UserTurn};
pub use media::{MediaBlob, MediaRef, Provenance};
pub use provider::{
    HarmBlockThreshold, HarmCategory, HarmProbability, ModelReply, ModelRequest, ModelResponse,
    Provider, SafetyRating, ToolDefinition, Usage,
};
pub use channel::{Channel, InboundEvent, OutboundMessage, OutboundPayload};
pub use tool::{ParamKind, Tool, ToolCall, ToolOutcome, ToolRegistry, ToolSchema};
pub use event::{DomainEvent, EventBus};
pub use memory::MemoryBank;
