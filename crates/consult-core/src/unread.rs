use std::collections::HashMap;

/// Per-conversation unread counters and their derived total.
///
/// All arithmetic is saturating: no counter, and therefore no total,
/// can ever go negative.
#[derive(Debug, Default, Clone)]
pub struct UnreadAccountant {
    counts: HashMap<String, u64>,
    focused: Option<String>,
}

impl UnreadAccountant {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark which conversation is currently open, if any.
    ///
    /// Deliveries for the focused conversation are treated as read
    /// immediately instead of incrementing its counter.
    pub fn set_focused(&mut self, conversation_id: Option<&str>) {
        self.focused = conversation_id.map(str::to_owned);
    }

    pub fn focused(&self) -> Option<&str> {
        self.focused.as_deref()
    }

    /// Account for one delivered message.
    ///
    /// Returns `true` when the conversation is focused and the message
    /// should be acked read right away rather than counted.
    pub fn on_message_delivered(&mut self, conversation_id: &str) -> bool {
        if self.focused.as_deref() == Some(conversation_id) {
            return true;
        }
        let count = self.counts.entry(conversation_id.to_owned()).or_insert(0);
        *count = count.saturating_add(1);
        false
    }

    /// Account for a message retracted before it was read.
    pub fn on_message_deleted(&mut self, conversation_id: &str) {
        if let Some(count) = self.counts.get_mut(conversation_id) {
            *count = count.saturating_sub(1);
        }
    }

    /// Reset one conversation's counter.
    pub fn on_mark_read(&mut self, conversation_id: &str) {
        self.counts.remove(conversation_id);
    }

    /// Reset every counter.
    pub fn on_mark_all_read(&mut self) {
        self.counts.clear();
    }

    /// Seed a counter from the REST collaborator.
    pub fn set_count(&mut self, conversation_id: &str, count: u64) {
        if count == 0 {
            self.counts.remove(conversation_id);
        } else {
            self.counts.insert(conversation_id.to_owned(), count);
        }
    }

    /// Current counter for one conversation.
    pub fn count(&self, conversation_id: &str) -> u64 {
        self.counts.get(conversation_id).copied().unwrap_or(0)
    }

    /// Sum of all per-conversation counters.
    pub fn total_unread(&self) -> u64 {
        self.counts
            .values()
            .fold(0u64, |total, count| total.saturating_add(*count))
    }
}
