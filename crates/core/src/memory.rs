//! Memory trait: notes the model keeps about its users across conversations.
//!
//! The model writes through the `save_memory` tool; the orchestrator reads
//! everything back into the first turn of a fresh conversation.

use async_trait::async_trait;

use crate::error::MemoryError;

#[async_trait]
pub trait MemoryBank: Send + Sync {
    /// Append one note.
    async fn save(&self, note: &str) -> Result<(), MemoryError>;

    /// Every saved note, oldest first. Empty when nothing was saved.
    async fn load(&self) -> Result<String, MemoryError>;
}
