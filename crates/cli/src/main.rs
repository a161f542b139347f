//! gemcord CLI — the main entry point.
//!
//! Commands:
//! - `init`  — Write a default config file
//! - `chat`  — One message (`-m`) or an interactive terminal session
//! - `run`   — Start the dispatcher on a chat channel

use clap::{Parser, Subcommand, ValueEnum};

mod commands;

#[derive(Parser)]
#[command(
    name = "gemcord",
    about = "gemcord — multimodal Gemini chat bot",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init,

    /// Chat with the bot from the terminal
    Chat {
        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Start serving a chat channel
    Run {
        /// The channel to serve
        #[arg(short, long, value_enum, default_value_t = ChannelKind::Cli)]
        channel: ChannelKind,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ChannelKind {
    /// Interactive terminal chat
    Cli,
    /// Discord adapter with no gateway connection yet: it only relays
    /// messages injected in-process, so on its own it receives nothing
    Discord,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Init => commands::init::run().await?,
        Commands::Chat { message } => commands::chat::run(message).await?,
        Commands::Run { channel } => commands::run::run(channel).await?,
    }

    Ok(())
}
