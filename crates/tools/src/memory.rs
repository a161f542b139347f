//! Memory tool: lets the model keep notes about users across conversations.
//!
//! Notes are appended to a plain text file, one per line. The orchestrator
//! reads the whole file back into the first turn of each new conversation.

use async_trait::async_trait;
use gemcord_core::error::{MemoryError, ToolError};
use gemcord_core::memory::MemoryBank;
use gemcord_core::tool::{ParamKind, Tool, ToolSchema};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

const TOOL_NAME: &str = "save_memory";

/// Notes stored in a text file.
pub struct FileMemory {
    path: PathBuf,
    /// Serializes appends from concurrent conversations
    write_lock: Mutex<()>,
}

impl FileMemory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl MemoryBank for FileMemory {
    async fn save(&self, note: &str) -> Result<(), MemoryError> {
        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                MemoryError::Storage(format!("Failed to create memory directory: {e}"))
            })?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to open memory file: {e}")))?;
        file.write_all(format!("\n{note}").as_bytes())
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to write memory file: {e}")))?;
        file.flush()
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to write memory file: {e}")))?;

        debug!(path = %self.path.display(), bytes = note.len(), "Memory saved");
        Ok(())
    }

    async fn load(&self) -> Result<String, MemoryError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(content.trim().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(MemoryError::Storage(format!("Failed to read memory file: {e}"))),
        }
    }
}

pub struct SaveMemoryTool {
    bank: Arc<dyn MemoryBank>,
}

impl SaveMemoryTool {
    pub fn new(bank: Arc<dyn MemoryBank>) -> Self {
        Self { bank }
    }
}

#[async_trait]
impl Tool for SaveMemoryTool {
    fn name(&self) -> &str {
        TOOL_NAME
    }

    fn description(&self) -> &str {
        "Save a short note to your long-term memory. Saved notes are shown to you at the \
         start of every new conversation. Use it for lasting facts about users, not for \
         the current chat."
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::new().required("msg", ParamKind::String, "The note to remember")
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let note = arguments["msg"].as_str().unwrap_or_default().trim();
        if note.is_empty() {
            return Err(ToolError::Failed {
                tool_name: TOOL_NAME.into(),
                reason: "msg is empty".into(),
            });
        }
        // One note per line.
        let note = note.replace('\n', " ");

        self.bank.save(&note).await.map_err(|e| ToolError::Failed {
            tool_name: TOOL_NAME.into(),
            reason: e.to_string(),
        })?;
        Ok(serde_json::json!({"saved": true}))
    }
}
