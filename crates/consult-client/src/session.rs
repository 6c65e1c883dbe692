//! Per-conversation session: wires the push channel, the REST
//! collaborator, and the core state containers together.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use consult_core::{
    ClientEvent, ConnectionState, ConversationSummary, DEFAULT_TYPING_TTL_MS,
    EventSubscriptionRegistry, Message, MessageDraft, MessageTimeline, PresenceTracker,
    ServerEvent, ServerEventKind, SubscriptionToken, SyncError, SyncErrorCategory, TimelineEntry,
    TypingUser,
};
use tokio::sync::{broadcast, watch};
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::rest::{ConsultBackend, SendRequest};
use crate::ws::ConnectionManager;

pub const DEFAULT_HISTORY_PAGE_SIZE: u16 = 50;
const UPDATE_BUFFER: usize = 256;

/// Session tuning knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub history_page_size: u16,
    pub typing_ttl_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_page_size: DEFAULT_HISTORY_PAGE_SIZE,
            typing_ttl_ms: DEFAULT_TYPING_TTL_MS,
        }
    }
}

/// Change notification emitted by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    /// A newly delivered remote message, before the timeline notification.
    MessageDelivered(Message),
    /// Timeline entries changed (insert, confirm, read, delete).
    TimelineChanged,
    /// Online/offline state changed.
    PresenceChanged,
    /// The set of typing users changed.
    TypingChanged,
}

/// One open conversation.
///
/// Created around a [`ConversationSummary`]; a transient summary (no
/// persisted ID yet) can draft and send, but cannot open the push
/// channel until the first confirmed send promotes it.
pub struct ConversationSession<B: ConsultBackend> {
    backend: Arc<B>,
    manager: ConnectionManager,
    conversation: ConversationSummary,
    local_user_id: String,
    local_user_name: String,
    timeline: Arc<StdMutex<MessageTimeline>>,
    presence: Arc<StdMutex<PresenceTracker>>,
    // Conversation id the new-message handler filters on; updated in
    // place when a transient conversation is promoted.
    conversation_filter: Arc<StdMutex<String>>,
    tokens: Vec<SubscriptionToken>,
    updates_tx: broadcast::Sender<SessionUpdate>,
    config: SessionConfig,
}

impl<B: ConsultBackend> ConversationSession<B> {
    pub fn new(
        backend: Arc<B>,
        ws_url: Url,
        conversation: ConversationSummary,
        local_user_id: impl Into<String>,
        local_user_name: impl Into<String>,
        config: SessionConfig,
    ) -> Self {
        let local_user_id = local_user_id.into();
        let registry = Arc::new(EventSubscriptionRegistry::new());
        let manager = ConnectionManager::new(ws_url, registry);
        let timeline = Arc::new(StdMutex::new(MessageTimeline::new(
            conversation.id.clone().unwrap_or_default(),
        )));
        let presence = Arc::new(StdMutex::new(PresenceTracker::with_ttl(
            local_user_id.clone(),
            config.typing_ttl_ms,
        )));
        let (updates_tx, _) = broadcast::channel(UPDATE_BUFFER);
        let conversation_filter = Arc::new(StdMutex::new(
            conversation.id.clone().unwrap_or_default(),
        ));
        let tokens = register_handlers(
            manager.registry(),
            &conversation_filter,
            &timeline,
            &presence,
            &updates_tx,
        );
        Self {
            backend,
            manager,
            conversation,
            local_user_id,
            local_user_name: local_user_name.into(),
            timeline,
            presence,
            conversation_filter,
            tokens,
            updates_tx,
            config,
        }
    }

    pub fn conversation(&self) -> &ConversationSummary {
        &self.conversation
    }

    /// Registry backing this session's event wiring.
    pub fn registry(&self) -> &Arc<EventSubscriptionRegistry> {
        self.manager.registry()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.manager.current_state()
    }

    pub fn state_signal(&self) -> watch::Receiver<ConnectionState> {
        self.manager.state_signal()
    }

    /// Subscribe to change notifications.
    pub fn updates(&self) -> broadcast::Receiver<SessionUpdate> {
        self.updates_tx.subscribe()
    }

    /// Open the push channel for this conversation.
    pub async fn connect(&self, bearer_token: &str) -> Result<(), SyncError> {
        let Some(conversation_id) = self.conversation.id.as_deref() else {
            return Err(SyncError::new(
                SyncErrorCategory::Config,
                "conversation_not_persisted",
                "send the first message before opening the push channel",
            ));
        };
        self.manager
            .open(conversation_id, &self.local_user_id, bearer_token)
            .await
    }

    /// Load the first history page into the timeline, replacing any
    /// previous contents. On failure the timeline is left untouched.
    pub async fn load_history(&self) -> Result<usize, SyncError> {
        let Some(conversation_id) = self.conversation.id.as_deref() else {
            return Ok(0);
        };
        let page = self
            .backend
            .messages_page(conversation_id, 1, self.config.history_page_size)
            .await
            .map_err(SyncError::history_load_failed)?;
        let count = page.len();
        lock(&self.timeline).seed_history(page);
        let _ = self.updates_tx.send(SessionUpdate::TimelineChanged);
        Ok(count)
    }

    /// Send a draft. The timeline shows an optimistic entry immediately;
    /// a confirmed send replaces it (promoting a transient conversation
    /// on the way), a failed send flags it for retry or discard.
    pub async fn send(&mut self, draft: MessageDraft) -> Result<Message, SyncError> {
        let optimistic = Message {
            id: String::new(),
            conversation_id: self.conversation.id.clone().unwrap_or_default(),
            sender_id: self.local_user_id.clone(),
            receiver_id: draft.receiver_id.clone(),
            content: draft.content.clone(),
            attachments: draft.attachments.clone(),
            created_at_ms: unix_now_ms(),
            read: false,
            read_at_ms: None,
            deleted: false,
            kind: draft.kind,
        };
        let local_ref = lock(&self.timeline).append_optimistic(optimistic);
        let _ = self.updates_tx.send(SessionUpdate::TimelineChanged);

        let request = SendRequest {
            conversation_id: self.conversation.id.clone(),
            case_id: self.conversation.case_id.clone(),
            draft,
            client_ref: Uuid::new_v4().to_string(),
        };
        match self.backend.send_message(&request).await {
            Ok(confirmed) => {
                if self.conversation.promote(confirmed.conversation_id.clone()) {
                    *lock(&self.conversation_filter) = confirmed.conversation_id.clone();
                    debug!(
                        conversation_id = %confirmed.conversation_id,
                        "transient conversation promoted on first confirmed send"
                    );
                }
                lock(&self.timeline).confirm(&local_ref, confirmed.clone());
                let _ = self.updates_tx.send(SessionUpdate::TimelineChanged);
                Ok(confirmed)
            }
            Err(err) => {
                lock(&self.timeline).reject(&local_ref);
                let _ = self.updates_tx.send(SessionUpdate::TimelineChanged);
                Err(SyncError::send_failed(err))
            }
        }
    }

    /// Drop a failed optimistic entry.
    pub fn discard_failed(&self, local_ref: &str) -> bool {
        let removed = lock(&self.timeline).discard(local_ref);
        if removed {
            let _ = self.updates_tx.send(SessionUpdate::TimelineChanged);
        }
        removed
    }

    /// Fire-and-forget typing-start frame.
    pub fn notify_typing_start(&self) -> bool {
        let Some(conversation_id) = self.conversation.id.clone() else {
            return false;
        };
        self.manager.send_event(ClientEvent::TypingStart {
            conversation_id,
            user_id: self.local_user_id.clone(),
            user_name: self.local_user_name.clone(),
        })
    }

    /// Fire-and-forget typing-stop frame.
    pub fn notify_typing_stop(&self) -> bool {
        let Some(conversation_id) = self.conversation.id.clone() else {
            return false;
        };
        self.manager.send_event(ClientEvent::TypingStop {
            conversation_id,
            user_id: self.local_user_id.clone(),
        })
    }

    /// Publish the local user's online status.
    pub fn publish_online(&self, is_online: bool) -> bool {
        self.manager.send_event(ClientEvent::UpdateOnlineStatus {
            user_id: self.local_user_id.clone(),
            is_online,
        })
    }

    /// Snapshot of the current timeline entries, oldest first.
    pub fn timeline_entries(&self) -> Vec<TimelineEntry> {
        lock(&self.timeline).entries().to_vec()
    }

    /// Remote users currently typing, as of `now_ms`.
    pub fn typing_users(&self, now_ms: u64) -> Vec<TypingUser> {
        lock(&self.presence).typing_users(now_ms)
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        lock(&self.presence).is_online(user_id)
    }

    /// Inbound frames dropped for failing shape validation.
    pub fn malformed_event_count(&self) -> u64 {
        self.manager.malformed_event_count()
    }

    /// Tear the session down: unsubscribe every handler, clear typing
    /// state, and close the channel. Events dispatched after this call
    /// reach no handler of this session.
    pub async fn close(&mut self) {
        let registry = self.manager.registry().clone();
        for token in self.tokens.drain(..) {
            registry.unsubscribe(token);
        }
        lock(&self.presence).clear_typing();
        self.manager.close().await;
    }
}

fn register_handlers(
    registry: &Arc<EventSubscriptionRegistry>,
    conversation_filter: &Arc<StdMutex<String>>,
    timeline: &Arc<StdMutex<MessageTimeline>>,
    presence: &Arc<StdMutex<PresenceTracker>>,
    updates_tx: &broadcast::Sender<SessionUpdate>,
) -> Vec<SubscriptionToken> {
    let mut tokens = Vec::with_capacity(ServerEventKind::ALL.len());

    {
        let conversation_filter = conversation_filter.clone();
        let timeline = timeline.clone();
        let updates = updates_tx.clone();
        tokens.push(registry.subscribe(
            ServerEventKind::NewMessage,
            Box::new(move |event| {
                if let ServerEvent::NewMessage(message) = event {
                    // Frames for other conversations are not ours to merge.
                    let expected = lock(&conversation_filter).clone();
                    if message.conversation_id != expected {
                        return;
                    }
                    if lock(&timeline).append_streamed(message.clone()) {
                        let _ = updates.send(SessionUpdate::MessageDelivered(message.clone()));
                        let _ = updates.send(SessionUpdate::TimelineChanged);
                    }
                }
            }),
        ));
    }

    {
        let timeline = timeline.clone();
        let updates = updates_tx.clone();
        tokens.push(registry.subscribe(
            ServerEventKind::MessageRead,
            Box::new(move |event| {
                if let ServerEvent::MessageRead {
                    message_id,
                    read_at_ms,
                } = event
                    && lock(&timeline).mark_read(message_id, *read_at_ms)
                {
                    let _ = updates.send(SessionUpdate::TimelineChanged);
                }
            }),
        ));
    }

    {
        let timeline = timeline.clone();
        let updates = updates_tx.clone();
        tokens.push(registry.subscribe(
            ServerEventKind::MessageDeleted,
            Box::new(move |event| {
                if let ServerEvent::MessageDeleted { message_id } = event
                    && lock(&timeline).mark_deleted(message_id)
                {
                    let _ = updates.send(SessionUpdate::TimelineChanged);
                }
            }),
        ));
    }

    let presence_kinds = [
        (ServerEventKind::TypingStart, SessionUpdate::TypingChanged),
        (ServerEventKind::TypingStop, SessionUpdate::TypingChanged),
        (ServerEventKind::PresenceOnline, SessionUpdate::PresenceChanged),
        (ServerEventKind::PresenceOffline, SessionUpdate::PresenceChanged),
    ];
    for (kind, update) in presence_kinds {
        let presence = presence.clone();
        let updates = updates_tx.clone();
        tokens.push(registry.subscribe(
            kind,
            Box::new(move |event| {
                lock(&presence).apply(event, unix_now_ms());
                let _ = updates.send(update.clone());
            }),
        ));
    }

    tokens
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
