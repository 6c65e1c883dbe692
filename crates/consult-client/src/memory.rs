//! In-memory [`ConsultBackend`] used by tests and the offline smoke demo.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use consult_core::{ConversationSummary, Message, SyncError, SyncErrorCategory};

use crate::rest::{ConsultBackend, SendRequest};

type SendHook = Box<dyn Fn(&Message) + Send + Sync>;

/// Deterministic fake backend.
///
/// Confirmed message IDs are `srv-N` and server-created conversation IDs
/// are `c-new-N`, both in send order. A send hook can observe each
/// confirmed message before the send call returns, which lets tests
/// replay it through a registry to exercise the streamed-echo race.
#[derive(Default)]
pub struct InMemoryBackend {
    state: Mutex<InMemoryState>,
    send_hook: Mutex<Option<SendHook>>,
}

#[derive(Default)]
struct InMemoryState {
    conversations: Vec<ConversationSummary>,
    histories: HashMap<String, Vec<Message>>,
    next_id: u64,
    list_calls: usize,
    message_read_acks: Vec<String>,
    conversation_read_acks: Vec<String>,
    fail_lists: bool,
    fail_history: bool,
    fail_send: bool,
    fail_archive: bool,
}

impl InMemoryBackend {
    fn lock(&self) -> std::sync::MutexGuard<'_, InMemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a conversation to the served list.
    pub fn seed_conversation(&self, summary: ConversationSummary) {
        self.lock().conversations.push(summary);
    }

    /// Set the newest-first history served for a conversation.
    pub fn seed_history(&self, conversation_id: impl Into<String>, newest_first: Vec<Message>) {
        self.lock().histories.insert(conversation_id.into(), newest_first);
    }

    /// Observe each confirmed message before `send_message` returns it.
    pub fn set_send_hook(&self, hook: impl Fn(&Message) + Send + Sync + 'static) {
        *self.send_hook.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(hook));
    }

    pub fn fail_lists(&self, fail: bool) {
        self.lock().fail_lists = fail;
    }

    pub fn fail_history(&self, fail: bool) {
        self.lock().fail_history = fail;
    }

    pub fn fail_send(&self, fail: bool) {
        self.lock().fail_send = fail;
    }

    pub fn fail_archive(&self, fail: bool) {
        self.lock().fail_archive = fail;
    }

    /// How many times `list_conversations` was called.
    pub fn list_call_count(&self) -> usize {
        self.lock().list_calls
    }

    /// Message IDs acknowledged through `mark_message_read`.
    pub fn message_read_acks(&self) -> Vec<String> {
        self.lock().message_read_acks.clone()
    }

    /// Conversation IDs acknowledged through `mark_conversation_read`.
    pub fn conversation_read_acks(&self) -> Vec<String> {
        self.lock().conversation_read_acks.clone()
    }

    fn unavailable() -> SyncError {
        SyncError::new(
            SyncErrorCategory::Network,
            "backend_unavailable",
            "in-memory backend configured to fail",
        )
    }
}

impl ConsultBackend for InMemoryBackend {
    async fn list_conversations(
        &self,
        include_archived: bool,
    ) -> Result<Vec<ConversationSummary>, SyncError> {
        let mut state = self.lock();
        state.list_calls += 1;
        if state.fail_lists {
            return Err(Self::unavailable());
        }
        Ok(state
            .conversations
            .iter()
            .filter(|summary| include_archived || !summary.archived)
            .cloned()
            .collect())
    }

    async fn search_conversations(
        &self,
        query: &str,
    ) -> Result<Vec<ConversationSummary>, SyncError> {
        let state = self.lock();
        if state.fail_lists {
            return Err(Self::unavailable());
        }
        let needle = query.to_lowercase();
        Ok(state
            .conversations
            .iter()
            .filter(|summary| {
                summary.case_id.to_lowercase().contains(&needle)
                    || summary
                        .last_message_preview
                        .as_deref()
                        .is_some_and(|preview| preview.to_lowercase().contains(&needle))
            })
            .cloned()
            .collect())
    }

    async fn conversation(
        &self,
        conversation_id: &str,
    ) -> Result<ConversationSummary, SyncError> {
        self.lock()
            .conversations
            .iter()
            .find(|summary| summary.id.as_deref() == Some(conversation_id))
            .cloned()
            .ok_or_else(|| {
                SyncError::new(
                    SyncErrorCategory::Config,
                    "conversation_not_found",
                    format!("no conversation '{conversation_id}'"),
                )
            })
    }

    async fn conversation_by_case(
        &self,
        case_id: &str,
    ) -> Result<ConversationSummary, SyncError> {
        self.lock()
            .conversations
            .iter()
            .find(|summary| summary.case_id == case_id)
            .cloned()
            .ok_or_else(|| {
                SyncError::new(
                    SyncErrorCategory::Config,
                    "conversation_not_found",
                    format!("no conversation for case '{case_id}'"),
                )
            })
    }

    async fn messages_page(
        &self,
        conversation_id: &str,
        page: u32,
        per_page: u16,
    ) -> Result<Vec<Message>, SyncError> {
        let state = self.lock();
        if state.fail_history {
            return Err(Self::unavailable());
        }
        let skip = (page.saturating_sub(1) as usize) * per_page as usize;
        Ok(state
            .histories
            .get(conversation_id)
            .map(|history| {
                history
                    .iter()
                    .skip(skip)
                    .take(per_page as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn send_message(&self, request: &SendRequest) -> Result<Message, SyncError> {
        let message = {
            let mut state = self.lock();
            if state.fail_send {
                return Err(Self::unavailable());
            }
            state.next_id += 1;
            let n = state.next_id;
            let conversation_id = request
                .conversation_id
                .clone()
                .unwrap_or_else(|| format!("c-new-{n}"));
            let message = Message {
                id: format!("srv-{n}"),
                conversation_id: conversation_id.clone(),
                sender_id: "u-local".to_owned(),
                receiver_id: request.draft.receiver_id.clone(),
                content: request.draft.content.clone(),
                attachments: request.draft.attachments.clone(),
                created_at_ms: n * 1_000,
                read: false,
                read_at_ms: None,
                deleted: false,
                kind: request.draft.kind,
            };
            state
                .histories
                .entry(conversation_id)
                .or_default()
                .insert(0, message.clone());
            message
        };
        // Hook runs outside the state lock; it may dispatch into handlers.
        if let Some(hook) = self
            .send_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            hook(&message);
        }
        Ok(message)
    }

    async fn mark_message_read(&self, message_id: &str) -> Result<(), SyncError> {
        self.lock().message_read_acks.push(message_id.to_owned());
        Ok(())
    }

    async fn mark_conversation_read(&self, conversation_id: &str) -> Result<(), SyncError> {
        self.lock()
            .conversation_read_acks
            .push(conversation_id.to_owned());
        Ok(())
    }

    async fn archive_conversation(
        &self,
        conversation_id: &str,
        archived: bool,
    ) -> Result<(), SyncError> {
        let mut state = self.lock();
        if state.fail_archive {
            return Err(Self::unavailable());
        }
        match state
            .conversations
            .iter_mut()
            .find(|summary| summary.id.as_deref() == Some(conversation_id))
        {
            Some(summary) => {
                summary.archived = archived;
                Ok(())
            }
            None => Err(SyncError::new(
                SyncErrorCategory::Config,
                "conversation_not_found",
                format!("no conversation '{conversation_id}'"),
            )),
        }
    }

    async fn total_unread(&self) -> Result<u64, SyncError> {
        Ok(self
            .lock()
            .conversations
            .iter()
            .fold(0u64, |total, summary| {
                total.saturating_add(summary.unread_count)
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use consult_core::MessageDraft;

    fn summary(id: &str, case_id: &str) -> ConversationSummary {
        ConversationSummary {
            id: Some(id.to_owned()),
            case_id: case_id.to_owned(),
            participant_ids: vec!["u-doctor".to_owned(), "u-patient".to_owned()],
            last_message_preview: None,
            last_activity_ms: 1_000,
            unread_count: 0,
            archived: false,
            is_new: false,
        }
    }

    #[tokio::test]
    async fn first_send_without_conversation_creates_one() {
        let backend = InMemoryBackend::default();
        let request = SendRequest {
            conversation_id: None,
            case_id: "case-9".to_owned(),
            draft: MessageDraft::text("u-patient", "hello"),
            client_ref: "ref-1".to_owned(),
        };
        let confirmed = backend.send_message(&request).await.expect("send");
        assert_eq!(confirmed.id, "srv-1");
        assert_eq!(confirmed.conversation_id, "c-new-1");
        let page = backend
            .messages_page("c-new-1", 1, 50)
            .await
            .expect("history");
        assert_eq!(page.len(), 1);
    }

    #[tokio::test]
    async fn archived_conversations_are_filtered_on_request() {
        let backend = InMemoryBackend::default();
        backend.seed_conversation(summary("c1", "case-1"));
        let mut archived = summary("c2", "case-2");
        archived.archived = true;
        backend.seed_conversation(archived);

        let visible = backend.list_conversations(false).await.expect("list");
        assert_eq!(visible.len(), 1);
        let all = backend.list_conversations(true).await.expect("list");
        assert_eq!(all.len(), 2);
        assert_eq!(backend.list_call_count(), 2);
    }

    #[tokio::test]
    async fn send_hook_sees_the_confirmed_message() {
        let backend = InMemoryBackend::default();
        let seen: std::sync::Arc<Mutex<Vec<String>>> = Default::default();
        let sink = seen.clone();
        backend.set_send_hook(move |message| {
            sink.lock().expect("seen lock").push(message.id.clone());
        });
        let request = SendRequest {
            conversation_id: Some("c1".to_owned()),
            case_id: "case-1".to_owned(),
            draft: MessageDraft::text("u-patient", "hi"),
            client_ref: "ref-1".to_owned(),
        };
        backend.send_message(&request).await.expect("send");
        assert_eq!(seen.lock().expect("seen lock").as_slice(), ["srv-1"]);
    }
}
