//! Subcommand implementations and the wiring they share.

pub mod chat;
pub mod init;
pub mod run;

use gemcord_agent::{Orchestrator, SessionMetadata, SessionStore};
use gemcord_config::AppConfig;
use gemcord_core::event::{DomainEvent, EventBus};
use gemcord_media::MediaResolver;
use gemcord_providers::GeminiProvider;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

/// Everything a running bot needs, built from the configuration.
pub struct Runtime {
    pub config: AppConfig,
    pub orchestrator: Arc<Orchestrator>,
    pub event_bus: Arc<EventBus>,
}

impl Runtime {
    pub fn build() -> Result<Self, Box<dyn std::error::Error>> {
        let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

        // Check for API key early — give a clear error
        let Some(api_key) = config.api_key.clone() else {
            eprintln!();
            eprintln!("  ERROR: No API key configured!");
            eprintln!();
            eprintln!("  Set one of these environment variables:");
            eprintln!("    GEMCORD_API_KEY=...");
            eprintln!("    GEMINI_API_KEY=...");
            eprintln!();
            eprintln!("  Or add it to your config file:");
            eprintln!("    {}", AppConfig::config_dir().join("config.toml").display());
            eprintln!();
            return Err("No API key found. See above for setup instructions.".into());
        };

        let provider = Arc::new(GeminiProvider::new(api_key));
        let memory = gemcord_tools::memory_bank(&config.tools);
        let tools = Arc::new(gemcord_tools::default_registry(&config.tools, memory.clone()));
        let media = Arc::new(MediaResolver::from_config(&config.media));
        let sessions = Arc::new(SessionStore::new(
            config.session.max_turns,
            SessionMetadata::from_config(&config),
        ));
        let event_bus = Arc::new(EventBus::default());
        let mut orchestrator = Orchestrator::from_config(
            &config,
            provider,
            tools,
            media,
            sessions,
            event_bus.clone(),
        );
        if let Some(memory) = memory {
            orchestrator = orchestrator.with_memory(memory);
        }
        let orchestrator = Arc::new(orchestrator);

        Ok(Self {
            config,
            orchestrator,
            event_bus,
        })
    }

    /// Log every domain event at debug level.
    pub fn spawn_event_logger(&self) -> tokio::task::JoinHandle<()> {
        let mut rx = self.event_bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => log_event(&event),
                    Err(RecvError::Lagged(missed)) => debug!(missed, "Event logger lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

fn log_event(event: &DomainEvent) {
    match event {
        DomainEvent::ResponseGenerated {
            conversation_id,
            model,
            tool_round_trips,
            tokens_used,
            ..
        } => debug!(%conversation_id, %model, tool_round_trips, ?tokens_used, "Response generated"),
        DomainEvent::ToolExecuted {
            conversation_id,
            tool_name,
            success,
            duration_ms,
            ..
        } => debug!(%conversation_id, tool = %tool_name, success, duration_ms, "Tool executed"),
        other => debug!(event = ?other, "Domain event"),
    }
}
