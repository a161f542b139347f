//! Model provider implementations for gemcord.
//!
//! All providers implement the `gemcord_core::Provider` trait; the
//! orchestrator never sees wire formats.

pub mod gemini;

pub use gemini::GeminiProvider;
