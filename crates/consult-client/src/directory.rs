//! Conversation-list coordination: roster cache, unread accounting,
//! and the REST calls that keep both in step with the server.

use std::sync::Arc;

use consult_core::{
    ConversationRoster, ConversationSummary, Message, RosterFilter, RosterUpdate, SyncError,
    SyncErrorCategory, UnreadAccountant,
};
use tracing::{debug, warn};

use crate::rest::ConsultBackend;

/// Keeps the conversation list and unread counters current.
///
/// The roster is a local cache refreshed from the REST collaborator and
/// nudged by push-channel deliveries; the accountant is the single
/// authority for unread counts between refreshes.
pub struct ConversationDirectory<B: ConsultBackend> {
    backend: Arc<B>,
    roster: ConversationRoster,
    unread: UnreadAccountant,
}

impl<B: ConsultBackend> ConversationDirectory<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            roster: ConversationRoster::new(),
            unread: UnreadAccountant::new(),
        }
    }

    /// Re-fetch the full list. On failure the previous list stays served.
    pub async fn refresh(&mut self) -> Result<usize, SyncError> {
        let summaries = self.backend.list_conversations(true).await?;
        for summary in &summaries {
            if let Some(id) = &summary.id {
                self.unread.set_count(id, summary.unread_count);
            }
        }
        let count = summaries.len();
        self.roster.replace(summaries);
        debug!(count, "conversation list refreshed");
        Ok(count)
    }

    /// List conversations. A non-empty search term goes to the server;
    /// otherwise the cached roster is filtered locally.
    pub async fn list(
        &self,
        filter: &RosterFilter,
    ) -> Result<Vec<ConversationSummary>, SyncError> {
        match filter.query.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
            Some(query) => self.backend.search_conversations(query).await,
            None => Ok(self
                .roster
                .filtered(filter)
                .into_iter()
                .cloned()
                .collect()),
        }
    }

    /// Cached roster, most recent activity first.
    pub fn cached(&self) -> &[ConversationSummary] {
        self.roster.items()
    }

    /// What the local user is currently looking at, for unread
    /// suppression. `None` means no conversation is focused.
    pub fn set_focused(&mut self, conversation_id: Option<&str>) {
        self.unread.set_focused(conversation_id);
    }

    /// Fold a push-channel delivery into the roster and counters.
    ///
    /// A delivery into the focused conversation is acknowledged as read
    /// instead of counted. A delivery for an unknown conversation
    /// triggers a full refresh rather than synthesizing an entry.
    pub async fn handle_new_message(&mut self, message: &Message) -> Result<(), SyncError> {
        match self.roster.apply_new_message(message) {
            RosterUpdate::Updated => {
                let conversation_id = message.conversation_id.as_str();
                if self.unread.on_message_delivered(conversation_id) {
                    self.roster.set_unread(conversation_id, 0);
                    self.backend.mark_message_read(&message.id).await?;
                } else {
                    self.roster
                        .set_unread(conversation_id, self.unread.count(conversation_id));
                }
                Ok(())
            }
            RosterUpdate::UnknownConversation => {
                warn!(
                    conversation_id = %message.conversation_id,
                    "delivery for unknown conversation; refreshing the list"
                );
                self.refresh().await.map(|_| ())
            }
        }
    }

    /// A message was deleted before the local user read it.
    pub fn handle_message_deleted(&mut self, conversation_id: &str) {
        self.unread.on_message_deleted(conversation_id);
        self.roster
            .set_unread(conversation_id, self.unread.count(conversation_id));
    }

    /// Zero one conversation's counter and acknowledge it server-side.
    pub async fn mark_read(&mut self, conversation_id: &str) -> Result<(), SyncError> {
        self.unread.on_mark_read(conversation_id);
        self.roster.set_unread(conversation_id, 0);
        self.backend.mark_conversation_read(conversation_id).await
    }

    /// Zero every counter locally, then acknowledge each conversation.
    /// The local reset holds even if some acknowledgements fail; the
    /// first failure is reported.
    pub async fn mark_all_read(&mut self) -> Result<(), SyncError> {
        self.unread.on_mark_all_read();
        let ids: Vec<String> = self
            .roster
            .items()
            .iter()
            .filter_map(|summary| summary.id.clone())
            .collect();
        let mut first_error = None;
        for id in ids {
            self.roster.set_unread(&id, 0);
            if let Err(err) = self.backend.mark_conversation_read(&id).await {
                warn!(conversation_id = %id, error = %err, "read acknowledgement failed");
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Flip the archived flag optimistically, rolling it back if the
    /// server rejects the change.
    pub async fn set_archived(
        &mut self,
        conversation_id: &str,
        archived: bool,
    ) -> Result<(), SyncError> {
        if !self.roster.set_archived(conversation_id, archived) {
            return Err(SyncError::new(
                SyncErrorCategory::Config,
                "conversation_not_found",
                format!("no cached conversation '{conversation_id}'"),
            ));
        }
        if let Err(err) = self
            .backend
            .archive_conversation(conversation_id, archived)
            .await
        {
            self.roster.set_archived(conversation_id, !archived);
            return Err(err);
        }
        Ok(())
    }

    /// Total unread across conversations, from the local counters.
    pub fn total_unread(&self) -> u64 {
        self.unread.total_unread()
    }

    /// Total unread per the server, for badge reconciliation.
    pub async fn server_total_unread(&self) -> Result<u64, SyncError> {
        self.backend.total_unread().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBackend;
    use consult_core::MessageKind;

    fn summary(id: &str, case_id: &str, last_activity_ms: u64) -> ConversationSummary {
        ConversationSummary {
            id: Some(id.to_owned()),
            case_id: case_id.to_owned(),
            participant_ids: vec!["u-doctor".to_owned(), "u-patient".to_owned()],
            last_message_preview: None,
            last_activity_ms,
            unread_count: 0,
            archived: false,
            is_new: false,
        }
    }

    fn delivery(id: &str, conversation_id: &str, created_at_ms: u64) -> Message {
        Message {
            id: id.to_owned(),
            conversation_id: conversation_id.to_owned(),
            sender_id: "u-patient".to_owned(),
            receiver_id: "u-doctor".to_owned(),
            content: "new result".to_owned(),
            attachments: Vec::new(),
            created_at_ms,
            read: false,
            read_at_ms: None,
            deleted: false,
            kind: MessageKind::Text,
        }
    }

    #[tokio::test]
    async fn refresh_failure_keeps_the_last_known_list() {
        let backend = Arc::new(InMemoryBackend::default());
        backend.seed_conversation(summary("c1", "case-1", 1_000));
        let mut directory = ConversationDirectory::new(backend.clone());
        directory.refresh().await.expect("refresh");
        assert_eq!(directory.cached().len(), 1);

        backend.fail_lists(true);
        directory.refresh().await.expect_err("refresh must fail");
        assert_eq!(directory.cached().len(), 1);
    }

    #[tokio::test]
    async fn delivery_reorders_and_counts() {
        let backend = Arc::new(InMemoryBackend::default());
        backend.seed_conversation(summary("A", "case-a", 10_000));
        backend.seed_conversation(summary("B", "case-b", 9_000));
        let mut directory = ConversationDirectory::new(backend);
        directory.refresh().await.expect("refresh");

        directory
            .handle_new_message(&delivery("m1", "B", 10_500))
            .await
            .expect("delivery");
        let cached = directory.cached();
        assert_eq!(cached[0].id.as_deref(), Some("B"));
        assert_eq!(cached[0].unread_count, 1);
        assert_eq!(directory.total_unread(), 1);
    }

    #[tokio::test]
    async fn focused_conversation_is_acknowledged_not_counted() {
        let backend = Arc::new(InMemoryBackend::default());
        backend.seed_conversation(summary("c1", "case-1", 1_000));
        let mut directory = ConversationDirectory::new(backend.clone());
        directory.refresh().await.expect("refresh");
        directory.set_focused(Some("c1"));

        directory
            .handle_new_message(&delivery("m1", "c1", 2_000))
            .await
            .expect("delivery");
        assert_eq!(directory.total_unread(), 0);
        assert_eq!(backend.message_read_acks(), ["m1"]);
    }

    #[tokio::test]
    async fn unknown_conversation_triggers_a_refresh() {
        let backend = Arc::new(InMemoryBackend::default());
        backend.seed_conversation(summary("c1", "case-1", 1_000));
        let mut directory = ConversationDirectory::new(backend.clone());
        directory.refresh().await.expect("refresh");

        // The new conversation already exists server-side.
        backend.seed_conversation(summary("c2", "case-2", 2_000));
        directory
            .handle_new_message(&delivery("m1", "c2", 2_500))
            .await
            .expect("delivery");
        assert_eq!(backend.list_call_count(), 2);
        assert!(directory.cached().iter().any(|s| s.id.as_deref() == Some("c2")));
    }

    #[tokio::test]
    async fn archive_rolls_back_when_the_server_rejects() {
        let backend = Arc::new(InMemoryBackend::default());
        backend.seed_conversation(summary("c1", "case-1", 1_000));
        let mut directory = ConversationDirectory::new(backend.clone());
        directory.refresh().await.expect("refresh");

        backend.fail_archive(true);
        directory
            .set_archived("c1", true)
            .await
            .expect_err("archive must fail");
        assert!(!directory.cached()[0].archived);

        backend.fail_archive(false);
        directory.set_archived("c1", true).await.expect("archive");
        assert!(directory.cached()[0].archived);
    }

    #[tokio::test]
    async fn mark_all_read_zeroes_every_counter() {
        let backend = Arc::new(InMemoryBackend::default());
        backend.seed_conversation(summary("c1", "case-1", 1_000));
        backend.seed_conversation(summary("c2", "case-2", 2_000));
        let mut directory = ConversationDirectory::new(backend.clone());
        directory.refresh().await.expect("refresh");

        directory
            .handle_new_message(&delivery("m1", "c1", 3_000))
            .await
            .expect("delivery");
        directory
            .handle_new_message(&delivery("m2", "c2", 3_100))
            .await
            .expect("delivery");
        assert_eq!(directory.total_unread(), 2);

        directory.mark_all_read().await.expect("mark all read");
        assert_eq!(directory.total_unread(), 0);
        assert!(directory.cached().iter().all(|s| s.unread_count == 0));
        let mut acks = backend.conversation_read_acks();
        acks.sort();
        assert_eq!(acks, ["c1", "c2"]);
    }

    #[tokio::test]
    async fn search_terms_are_delegated_to_the_server() {
        let backend = Arc::new(InMemoryBackend::default());
        backend.seed_conversation(summary("c1", "case-cardio", 1_000));
        backend.seed_conversation(summary("c2", "case-derm", 2_000));
        let mut directory = ConversationDirectory::new(backend);
        directory.refresh().await.expect("refresh");

        let filter = RosterFilter {
            include_archived: false,
            query: Some("cardio".to_owned()),
        };
        let results = directory.list(&filter).await.expect("search");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id.as_deref(), Some("c1"));
    }
}
