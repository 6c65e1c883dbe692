//! Synchronization core for the consultation messaging client.
//!
//! This crate defines the push-channel protocol, the connection
//! lifecycle machine, the timeline/presence/roster/unread state
//! containers, and the common error and backoff types. It performs no
//! I/O; the `consult-client` crate supplies the WebSocket and REST
//! adapters.

/// Push-channel lifecycle state machine.
pub mod connection;
/// Stable sync error types and HTTP classification helpers.
pub mod error;
/// Online/typing presence tracking with TTL expiry.
pub mod presence;
/// Typed subscribe/unsubscribe contract over inbound events.
pub mod registry;
/// Backoff policy for reconnect loops.
pub mod retry;
/// Conversation-list cache ordered by last activity.
pub mod roster;
/// Per-conversation ordered, deduplicated message merging.
pub mod timeline;
/// Protocol and domain types (events, messages, conversations).
pub mod types;
/// Per-conversation unread counters.
pub mod unread;

pub use connection::ConnectionStateMachine;
pub use error::{SyncError, SyncErrorCategory, classify_http_status};
pub use presence::{DEFAULT_TYPING_TTL_MS, PresenceInfo, PresenceTracker, TypingUser};
pub use registry::{EventHandler, EventSubscriptionRegistry, SubscriptionToken};
pub use retry::ReconnectPolicy;
pub use roster::{ConversationRoster, RosterFilter, RosterUpdate};
pub use timeline::{MessageTimeline, TimelineEntry};
pub use types::{
    Attachment, ClientEvent, ConnectionState, ConversationSummary, Message, MessageDraft,
    MessageKind, ServerEvent, ServerEventKind,
};
pub use unread::UnreadAccountant;
