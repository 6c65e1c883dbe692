//! WebSocket and REST adapters for the consultation sync core.
//!
//! `consult-core` holds the pure state containers; this crate supplies
//! the I/O around them: the push-channel [`ConnectionManager`], the
//! [`ConsultBackend`] REST trait with its HTTP implementation, the
//! per-conversation [`ConversationSession`], and the list-level
//! [`ConversationDirectory`].

/// Conversation-list coordination and unread accounting.
pub mod directory;
/// In-memory backend fake for tests and offline demos.
pub mod memory;
/// REST collaborator trait and reqwest implementation.
pub mod rest;
/// Per-conversation session glue.
pub mod session;
/// WebSocket push-channel manager.
pub mod ws;

pub use directory::ConversationDirectory;
pub use memory::InMemoryBackend;
pub use rest::{ConsultApi, ConsultBackend, SendRequest};
pub use session::{
    ConversationSession, DEFAULT_HISTORY_PAGE_SIZE, SessionConfig, SessionUpdate,
};
pub use ws::ConnectionManager;
