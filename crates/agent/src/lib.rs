//! The conversation engine of gemcord.
//!
//! Each inbound message becomes a **turn**:
//!
//! 1. **Queue** the message behind earlier ones from the same conversation
//! 2. **Resolve** attachments and video links into media blobs
//! 3. **Ask the model**, with the session history and the new user turn
//! 4. **If tool calls**: run them, feed the results back, ask again
//! 5. **If an answer**: commit the exchange and chunk the reply for the platform
//!
//! The tool loop is capped; a turn that fails or is cancelled commits nothing
//! and answers with a single notice.

pub mod chunker;
pub mod dispatch;
pub mod orchestrator;
pub mod session;

pub use chunker::{ReplyChunks, chunk};
pub use dispatch::Dispatcher;
pub use orchestrator::{Command, Orchestrator, Reply, Toggle, TurnState};
pub use session::{ActiveTurn, Session, SessionMetadata, SessionStore};
