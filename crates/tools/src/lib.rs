//! Built-in tool implementations for gemcord.
//!
//! Tools give the model access to exact computation and fresh information:
//! symbolic math (Wolfram|Alpha, or a local evaluator when no app ID is
//! configured) and web search. With memory enabled, `save_memory` lets the
//! model keep notes across conversations.

pub mod memory;
pub mod symbolic_math;
pub mod web_search;

use gemcord_config::ToolsConfig;
use gemcord_core::memory::MemoryBank;
use gemcord_core::tool::ToolRegistry;
use std::sync::Arc;
use std::time::Duration;

pub use memory::{FileMemory, SaveMemoryTool};
pub use symbolic_math::{LocalEvaluator, MathBackend, SymbolicMathTool, WolframAlphaBackend};
pub use web_search::{DuckDuckGoBackend, SearchBackend, SearchResult, WebSearchTool};

/// The configured memory store, if memory is enabled.
pub fn memory_bank(config: &ToolsConfig) -> Option<Arc<dyn MemoryBank>> {
    config
        .memory_enabled
        .then(|| Arc::new(FileMemory::new(config.memory_path())) as Arc<dyn MemoryBank>)
}

/// Create the default tool registry from configuration.
///
/// `memory` is the store `save_memory` writes to; without one the tool is
/// not offered.
pub fn default_registry(config: &ToolsConfig, memory: Option<Arc<dyn MemoryBank>>) -> ToolRegistry {
    let timeout = Duration::from_secs(config.timeout_secs);
    let mut registry = ToolRegistry::new(timeout);

    let math: Arc<dyn MathBackend> = match &config.wolfram_app_id {
        Some(app_id) => Arc::new(WolframAlphaBackend::new(app_id, timeout)),
        None => Arc::new(LocalEvaluator),
    };
    registry.register(Box::new(SymbolicMathTool::new(math)));
    registry.register(Box::new(WebSearchTool::new(
        Arc::new(DuckDuckGoBackend::new(timeout)),
        config.search_max_results,
    )));
    if let Some(bank) = memory {
        registry.register(Box::new(SaveMemoryTool::new(bank)));
    }
    registry
}
