use std::collections::HashSet;

use tracing::{debug, trace};

use crate::types::Message;

/// One timeline slot: either a locally-authored message awaiting server
/// confirmation, or a server-confirmed one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineEntry {
    /// Locally-authored message, visible immediately, pending confirmation.
    Optimistic {
        /// Local reference (`local-N`), also used as the placeholder id.
        local_ref: String,
        message: Message,
        /// Set when the send REST call failed; the draft stays recoverable.
        failed: bool,
    },
    /// Server-confirmed message.
    Confirmed(Message),
}

impl TimelineEntry {
    /// The message payload regardless of confirmation state.
    pub fn message(&self) -> &Message {
        match self {
            TimelineEntry::Optimistic { message, .. } => message,
            TimelineEntry::Confirmed(message) => message,
        }
    }

    /// Whether this entry is still awaiting confirmation.
    pub fn is_optimistic(&self) -> bool {
        matches!(self, TimelineEntry::Optimistic { .. })
    }

    /// Whether this is a failed send kept for retry/discard by the caller.
    pub fn is_failed_send(&self) -> bool {
        matches!(self, TimelineEntry::Optimistic { failed: true, .. })
    }

    fn sort_id(&self) -> &str {
        match self {
            TimelineEntry::Optimistic { local_ref, .. } => local_ref,
            TimelineEntry::Confirmed(message) => &message.id,
        }
    }

    fn sort_key(&self) -> (u64, &str) {
        (self.message().created_at_ms, self.sort_id())
    }
}

/// Ordered, deduplicated message sequence for one conversation.
///
/// Entries are always materialized sorted by created timestamp
/// ascending, id as tie-break, so a late-arriving older message lands
/// at its chronological position rather than the tail.
#[derive(Debug, Default, Clone)]
pub struct MessageTimeline {
    conversation_id: String,
    entries: Vec<TimelineEntry>,
    next_local_seq: u64,
}

impl MessageTimeline {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            entries: Vec::new(),
            next_local_seq: 0,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    /// Messages in display order.
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.entries.iter().map(TimelineEntry::message)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Seed the timeline from a REST history page.
    ///
    /// The collaborator returns pages newest-first; seeding reverses
    /// them into chronological order and drops duplicate ids. Existing
    /// entries are discarded: seeding is all-or-nothing, so a failed
    /// fetch (which never reaches this call) leaves the timeline empty
    /// rather than partially populated.
    pub fn seed_history(&mut self, page_newest_first: Vec<Message>) {
        self.entries.clear();
        let mut seen = HashSet::new();
        for message in page_newest_first.into_iter().rev() {
            if seen.insert(message.id.clone()) {
                self.insert_sorted(TimelineEntry::Confirmed(message));
            }
        }
        debug!(
            conversation_id = %self.conversation_id,
            count = self.entries.len(),
            "timeline seeded from history"
        );
    }

    /// Insert a server-delivered message at its sorted position.
    ///
    /// Duplicate delivery of an id already present is a no-op.
    pub fn append_streamed(&mut self, message: Message) -> bool {
        if self.contains_confirmed(&message.id) {
            trace!(message_id = %message.id, "duplicate streamed message ignored");
            return false;
        }
        self.insert_sorted(TimelineEntry::Confirmed(message));
        true
    }

    /// Insert a locally-authored message tagged optimistic.
    ///
    /// Returns the local ref used later by [`Self::confirm`] /
    /// [`Self::reject`]; the ref also replaces the message id so the
    /// entry is addressable while unconfirmed.
    pub fn append_optimistic(&mut self, mut message: Message) -> String {
        self.next_local_seq += 1;
        let local_ref = format!("local-{}", self.next_local_seq);
        message.id = local_ref.clone();
        self.insert_sorted(TimelineEntry::Optimistic {
            local_ref: local_ref.clone(),
            message,
            failed: false,
        });
        local_ref
    }

    /// Reconcile an optimistic entry with its server-confirmed counterpart.
    ///
    /// First-writer-wins on id: when the confirmed copy already arrived
    /// through the stream, the optimistic entry is discarded and the
    /// streamed one kept. Otherwise the optimistic entry is replaced in
    /// place and the timeline re-sorted on the server timestamp.
    /// An unknown `local_ref` falls back to a streamed insert, so the
    /// confirmed message is never lost.
    pub fn confirm(&mut self, local_ref: &str, confirmed: Message) {
        if self.contains_confirmed(&confirmed.id) {
            self.entries.retain(|entry| entry.sort_id() != local_ref);
            return;
        }

        match self
            .entries
            .iter()
            .position(|entry| entry.is_optimistic() && entry.sort_id() == local_ref)
        {
            Some(index) => {
                self.entries[index] = TimelineEntry::Confirmed(confirmed);
                self.resort();
            }
            None => {
                self.insert_sorted(TimelineEntry::Confirmed(confirmed));
            }
        }
    }

    /// Mark a failed send; the entry stays visible and recoverable.
    pub fn reject(&mut self, local_ref: &str) -> bool {
        for entry in &mut self.entries {
            if let TimelineEntry::Optimistic {
                local_ref: entry_ref,
                failed,
                ..
            } = entry
                && entry_ref == local_ref
            {
                *failed = true;
                return true;
            }
        }
        false
    }

    /// Drop a failed optimistic entry (the caller discarded the draft).
    pub fn discard(&mut self, local_ref: &str) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|entry| !(entry.is_optimistic() && entry.sort_id() == local_ref));
        before != self.entries.len()
    }

    /// Apply a read receipt. No-op when the id is absent.
    pub fn mark_read(&mut self, message_id: &str, read_at_ms: u64) -> bool {
        self.update_message(message_id, |message| {
            message.read = true;
            message.read_at_ms = Some(read_at_ms);
        })
    }

    /// Apply a soft delete. No-op when the id is absent.
    pub fn mark_deleted(&mut self, message_id: &str) -> bool {
        self.update_message(message_id, |message| {
            message.deleted = true;
        })
    }

    fn update_message(&mut self, message_id: &str, apply: impl FnOnce(&mut Message)) -> bool {
        let found = self
            .entries
            .iter_mut()
            .find(|entry| entry.sort_id() == message_id);
        match found {
            Some(entry) => {
                let message = match entry {
                    TimelineEntry::Optimistic { message, .. } => message,
                    TimelineEntry::Confirmed(message) => message,
                };
                apply(message);
                true
            }
            None => false,
        }
    }

    fn contains_confirmed(&self, message_id: &str) -> bool {
        self.entries
            .iter()
            .any(|entry| !entry.is_optimistic() && entry.sort_id() == message_id)
    }

    fn insert_sorted(&mut self, entry: TimelineEntry) {
        let key = (entry.message().created_at_ms, entry.sort_id().to_owned());
        let index = self
            .entries
            .partition_point(|existing| existing.sort_key() <= (key.0, key.1.as_str()));
        self.entries.insert(index, entry);
    }

    fn resort(&mut self) {
        self.entries.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    }
}
