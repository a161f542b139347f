//! Chat channel implementations for gemcord.
//!
//! Each channel connects to a chat platform and relays messages to/from
//! the dispatcher. Channels are trait-based and platform-agnostic.
//!
//! Available channels:
//! - **CLI** — Interactive terminal chat (stdin/stdout)
//! - **Discord** — Discord Bot API (stub with in-process injection)

pub mod cli;
pub mod discord;

pub use cli::CliChannel;
pub use discord::DiscordChannel;
