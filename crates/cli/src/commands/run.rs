//! `gemcord run` — serve a chat channel until it closes or Ctrl+C.

use gemcord_agent::Dispatcher;
use gemcord_channels::{CliChannel, DiscordChannel};
use gemcord_core::channel::Channel;
use std::sync::Arc;
use tracing::info;

use super::Runtime;
use crate::ChannelKind;

pub async fn run(kind: ChannelKind) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = Runtime::build()?;
    let _events = runtime.spawn_event_logger();

    let channel: Arc<dyn Channel> = match kind {
        ChannelKind::Cli => {
            println!("  gemcord — model {}", runtime.config.model);
            println!("  Type your message and press Enter. Attach files with @path.");
            println!("  {{clear}} resets the conversation, {{stop}} cancels a reply, 'exit' quits.");
            println!("  /usage shows the token count; /toggle sys|model|tools [N] switches settings.\n");
            Arc::new(CliChannel::new())
        }
        ChannelKind::Discord => {
            eprintln!("  Warning: the Discord channel has no gateway connection yet and will not");
            eprintln!("  receive messages on its own. Use `--channel cli` to chat from the terminal.\n");
            Arc::new(DiscordChannel::new(runtime.config.discord.clone()))
        }
    };

    let session = &runtime.config.session;
    let dispatcher = Arc::new(
        Dispatcher::new(runtime.orchestrator.clone(), channel)
            .with_max_message_length(runtime.config.reply.max_message_length)
            .with_eviction(
                session.idle_timeout(),
                session.eviction_interval(),
                runtime.event_bus.clone(),
            ),
    );

    let shutdown = dispatcher.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, shutting down");
            shutdown.cancel();
        }
    });

    dispatcher.run().await?;
    Ok(())
}
