use tracing::{debug, warn};

use crate::types::{ConversationSummary, Message};

/// Filter applied to the locally-cached conversation list.
///
/// A `query` here matches locally against preview text and case id;
/// full-text search is delegated to the REST collaborator by the
/// client layer when a search term is present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterFilter {
    /// Include archived conversations.
    pub include_archived: bool,
    /// Optional local substring match.
    pub query: Option<String>,
}

/// Result of applying a streamed message to the roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RosterUpdate {
    /// The conversation was present; preview/activity/unread updated.
    Updated,
    /// The conversation is not known locally. The caller must trigger a
    /// full list refetch; the roster never synthesizes a summary from a
    /// bare message event.
    UnknownConversation,
}

/// Locally-cached conversation summaries, ordered by last activity
/// descending.
///
/// Refetch failures are the caller's concern: the roster only ever sees
/// successful results, so the last-known list stays intact
/// (stale-but-available over empty).
#[derive(Debug, Default, Clone)]
pub struct ConversationRoster {
    items: Vec<ConversationSummary>,
}

impl ConversationRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cached list with a full refetch result.
    pub fn replace(&mut self, items: Vec<ConversationSummary>) {
        self.items = items;
        self.sort();
        debug!(count = self.items.len(), "conversation roster replaced");
    }

    /// Cached summaries in display order.
    pub fn items(&self) -> &[ConversationSummary] {
        &self.items
    }

    /// Summary for a persisted conversation id.
    pub fn get(&self, conversation_id: &str) -> Option<&ConversationSummary> {
        self.items
            .iter()
            .find(|item| item.id.as_deref() == Some(conversation_id))
    }

    /// Locally-filtered view of the cached list.
    pub fn filtered(&self, filter: &RosterFilter) -> Vec<&ConversationSummary> {
        let query = filter
            .query
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_lowercase);

        self.items
            .iter()
            .filter(|item| filter.include_archived || !item.archived)
            .filter(|item| match &query {
                None => true,
                Some(q) => {
                    item.case_id.to_lowercase().contains(q)
                        || item
                            .last_message_preview
                            .as_deref()
                            .is_some_and(|preview| preview.to_lowercase().contains(q))
                }
            })
            .collect()
    }

    /// Fold a streamed message into the cached list.
    ///
    /// Updates preview, last-activity, and unread fields and re-sorts;
    /// an unknown conversation id is reported back instead of being
    /// synthesized.
    pub fn apply_new_message(&mut self, message: &Message) -> RosterUpdate {
        let Some(item) = self
            .items
            .iter_mut()
            .find(|item| item.id.as_deref() == Some(message.conversation_id.as_str()))
        else {
            warn!(
                conversation_id = %message.conversation_id,
                "message event for conversation missing from roster"
            );
            return RosterUpdate::UnknownConversation;
        };

        item.last_message_preview = Some(message.content.clone());
        item.last_activity_ms = item.last_activity_ms.max(message.created_at_ms);
        item.unread_count = item.unread_count.saturating_add(1);
        self.sort();
        RosterUpdate::Updated
    }

    /// Overwrite one conversation's displayed unread count.
    pub fn set_unread(&mut self, conversation_id: &str, unread: u64) -> bool {
        match self.find_mut(conversation_id) {
            Some(item) => {
                item.unread_count = unread;
                true
            }
            None => false,
        }
    }

    /// Flip the archived flag locally. Used by the optimistic archive
    /// flow; the caller rolls the flag back when the REST call fails.
    pub fn set_archived(&mut self, conversation_id: &str, archived: bool) -> bool {
        match self.find_mut(conversation_id) {
            Some(item) => {
                item.archived = archived;
                true
            }
            None => false,
        }
    }

    fn find_mut(&mut self, conversation_id: &str) -> Option<&mut ConversationSummary> {
        self.items
            .iter_mut()
            .find(|item| item.id.as_deref() == Some(conversation_id))
    }

    fn sort(&mut self) {
        self.items.sort_by(|a, b| {
            b.last_activity_ms
                .cmp(&a.last_activity_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
    }
}
