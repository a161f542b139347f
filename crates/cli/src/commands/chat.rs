//! `gemcord chat` — single-message or interactive terminal chat.

use gemcord_agent::{Command, chunk};
use gemcord_channels::CliChannel;
use gemcord_channels::cli::render;

use super::Runtime;

pub async fn run(message: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(message) = message else {
        // Interactive mode is the CLI channel under the dispatcher.
        return super::run::run(crate::ChannelKind::Cli).await;
    };

    let runtime = Runtime::build()?;
    let _events = runtime.spawn_event_logger();
    let event = CliChannel::event_from_line(&message);

    let reply = match Command::parse(&event.text) {
        Some(command) => runtime.orchestrator.handle_command(&event, command).await,
        None => {
            eprint!("  Thinking...");
            let reply = runtime.orchestrator.handle(event).await;
            eprint!("\r              \r");
            Some(reply)
        }
    };

    if let Some(reply) = reply {
        let failed = reply.failed;
        for payload in chunk(reply.text, reply.media, runtime.config.reply.max_message_length) {
            println!("{}", render(&payload));
        }
        if failed {
            return Err("the turn did not complete".into());
        }
    }
    Ok(())
}
