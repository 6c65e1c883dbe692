use serde::{Deserialize, Serialize};

/// Kind of message payload carried in a timeline entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Plain text message.
    Text,
    /// Message whose content references one or more attachments.
    File,
}

/// File attached to a sent message. Immutable once the message is sent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    /// Server-assigned attachment ID.
    pub id: String,
    /// Original file name.
    pub file_name: String,
    /// MIME content type, for example `application/pdf`.
    pub mime_type: String,
    /// Size in bytes.
    pub byte_size: u64,
    /// Download reference resolved by the REST collaborator.
    pub download_url: String,
}

/// One message inside a conversation timeline.
///
/// Server-confirmed messages carry the server-assigned `id`; optimistic
/// copies use their local ref as a placeholder until confirmation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Message ID, unique within its conversation.
    pub id: String,
    /// Owning conversation ID.
    pub conversation_id: String,
    /// Sender user ID.
    pub sender_id: String,
    /// Receiver user ID.
    pub receiver_id: String,
    /// Text body (or attachment caption for file messages).
    pub content: String,
    /// Attachments, empty for plain text messages.
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Creation timestamp in milliseconds since Unix epoch.
    pub created_at_ms: u64,
    /// Whether the receiver has read the message.
    #[serde(default)]
    pub read: bool,
    /// Read-receipt timestamp when `read` is set.
    #[serde(default)]
    pub read_at_ms: Option<u64>,
    /// Soft-delete flag; deleted entries stay in the timeline.
    #[serde(default)]
    pub deleted: bool,
    /// Message kind.
    pub kind: MessageKind,
}

/// Locally-authored message input, before any server interaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft {
    /// Receiver user ID.
    pub receiver_id: String,
    /// Text body.
    pub content: String,
    /// Attachments already uploaded through the external upload flow.
    pub attachments: Vec<Attachment>,
    /// Message kind.
    pub kind: MessageKind,
}

impl MessageDraft {
    /// Convenience constructor for a plain text draft.
    pub fn text(receiver_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            receiver_id: receiver_id.into(),
            content: content.into(),
            attachments: Vec::new(),
            kind: MessageKind::Text,
        }
    }
}

/// Lightweight conversation metadata for list views.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationSummary {
    /// Persisted conversation ID; `None` for a transient conversation
    /// that has not been created on the server yet.
    pub id: Option<String>,
    /// Medical case this conversation belongs to.
    pub case_id: String,
    /// Participant user IDs.
    pub participant_ids: Vec<String>,
    /// Preview text of the most recent message.
    #[serde(default)]
    pub last_message_preview: Option<String>,
    /// Timestamp of the most recent activity in milliseconds.
    pub last_activity_ms: u64,
    /// Unread message count reported for the local user.
    #[serde(default)]
    pub unread_count: u64,
    /// Whether the conversation is archived.
    #[serde(default)]
    pub archived: bool,
    /// Transient flag: the conversation exists only locally until the
    /// first successful send promotes it.
    #[serde(default, skip_serializing)]
    pub is_new: bool,
}

impl ConversationSummary {
    /// Construct the transient conversation used when a case has none.
    pub fn transient(case_id: impl Into<String>, participant_ids: Vec<String>) -> Self {
        Self {
            id: None,
            case_id: case_id.into(),
            participant_ids,
            last_message_preview: None,
            last_activity_ms: 0,
            unread_count: 0,
            archived: false,
            is_new: true,
        }
    }

    /// Promote a transient conversation to a persisted one.
    ///
    /// Returns `false` when the summary was already persisted; promotion
    /// happens exactly once, on the first successful send.
    pub fn promote(&mut self, persisted_id: impl Into<String>) -> bool {
        if self.id.is_some() || !self.is_new {
            return false;
        }
        self.id = Some(persisted_id.into());
        self.is_new = false;
        true
    }
}

/// Lifecycle state of the push channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No channel is open.
    #[default]
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// Channel is open and joined to its conversation.
    Connected,
    /// Transport dropped; the manager is re-establishing the channel.
    Reconnecting,
}

/// Outbound client→server push-channel event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Join the channel for one conversation.
    JoinConversation {
        conversation_id: String,
        user_id: String,
    },
    /// Leave the conversation channel (best-effort on teardown).
    LeaveConversation {
        conversation_id: String,
        user_id: String,
    },
    /// The local user started typing.
    TypingStart {
        conversation_id: String,
        user_id: String,
        user_name: String,
    },
    /// The local user stopped typing.
    TypingStop {
        conversation_id: String,
        user_id: String,
    },
    /// Publish the local user's online status.
    UpdateOnlineStatus { user_id: String, is_online: bool },
}

/// Inbound server→client push-channel event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    /// A message was delivered to the conversation.
    NewMessage(Message),
    /// A message was read by its receiver.
    MessageRead { message_id: String, read_at_ms: u64 },
    /// A message was deleted (soft-remove).
    MessageDeleted { message_id: String },
    /// A remote user started typing.
    UserTypingStart {
        user_id: String,
        #[serde(default)]
        user_name: Option<String>,
    },
    /// A remote user stopped typing.
    UserTypingStop { user_id: String },
    /// A user came online.
    UserOnline { user_id: String },
    /// A user went offline.
    UserOffline { user_id: String },
}

/// Subscription key for [`ServerEvent`] dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerEventKind {
    NewMessage,
    MessageRead,
    MessageDeleted,
    TypingStart,
    TypingStop,
    PresenceOnline,
    PresenceOffline,
}

impl ServerEventKind {
    /// Every inbound event kind, in dispatch-registration order.
    pub const ALL: [ServerEventKind; 7] = [
        ServerEventKind::NewMessage,
        ServerEventKind::MessageRead,
        ServerEventKind::MessageDeleted,
        ServerEventKind::TypingStart,
        ServerEventKind::TypingStop,
        ServerEventKind::PresenceOnline,
        ServerEventKind::PresenceOffline,
    ];
}

impl ServerEvent {
    /// Subscription key for this event.
    pub fn kind(&self) -> ServerEventKind {
        match self {
            ServerEvent::NewMessage(_) => ServerEventKind::NewMessage,
            ServerEvent::MessageRead { .. } => ServerEventKind::MessageRead,
            ServerEvent::MessageDeleted { .. } => ServerEventKind::MessageDeleted,
            ServerEvent::UserTypingStart { .. } => ServerEventKind::TypingStart,
            ServerEvent::UserTypingStop { .. } => ServerEventKind::TypingStop,
            ServerEvent::UserOnline { .. } => ServerEventKind::PresenceOnline,
            ServerEvent::UserOffline { .. } => ServerEventKind::PresenceOffline,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str) -> Message {
        Message {
            id: id.to_owned(),
            conversation_id: "c1".to_owned(),
            sender_id: "u-doctor".to_owned(),
            receiver_id: "u-patient".to_owned(),
            content: "hello".to_owned(),
            attachments: Vec::new(),
            created_at_ms: 1_700_000_000_000,
            read: false,
            read_at_ms: None,
            deleted: false,
            kind: MessageKind::Text,
        }
    }

    #[test]
    fn client_events_use_wire_names() {
        let frame = serde_json::to_value(ClientEvent::JoinConversation {
            conversation_id: "c1".to_owned(),
            user_id: "u1".to_owned(),
        })
        .expect("serialize");

        assert_eq!(frame["event"], "join_conversation");
        assert_eq!(frame["payload"]["conversation_id"], "c1");
        assert_eq!(frame["payload"]["user_id"], "u1");
    }

    #[test]
    fn server_events_decode_from_wire_names() {
        let raw = r#"{"event":"user_typing_start","payload":{"user_id":"u2","user_name":"Dr. Ross"}}"#;
        let event: ServerEvent = serde_json::from_str(raw).expect("decode");
        assert_eq!(event.kind(), ServerEventKind::TypingStart);

        let raw = r#"{"event":"user_typing_stop","payload":{"user_id":"u2"}}"#;
        let event: ServerEvent = serde_json::from_str(raw).expect("decode");
        assert_eq!(
            event,
            ServerEvent::UserTypingStop {
                user_id: "u2".to_owned()
            }
        );
    }

    #[test]
    fn new_message_round_trips_through_envelope() {
        let event = ServerEvent::NewMessage(message("m1"));
        let raw = serde_json::to_string(&event).expect("serialize");
        assert!(raw.contains("\"new_message\""));
        let decoded: ServerEvent = serde_json::from_str(&raw).expect("decode");
        assert_eq!(decoded, event);
    }

    #[test]
    fn transient_conversation_promotes_exactly_once() {
        let mut summary = ConversationSummary::transient("case-9", vec!["u1".into(), "u2".into()]);
        assert!(summary.is_new);
        assert!(summary.promote("c42"));
        assert_eq!(summary.id.as_deref(), Some("c42"));
        assert!(!summary.is_new);
        assert!(!summary.promote("c43"));
        assert_eq!(summary.id.as_deref(), Some("c42"));
    }
}
