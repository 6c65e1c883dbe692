use std::collections::HashMap;

use tracing::trace;

use crate::types::ServerEvent;

/// Default typing-indicator expiry window.
pub const DEFAULT_TYPING_TTL_MS: u64 = 3_000;

/// Online/offline state for one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceInfo {
    pub is_online: bool,
    /// Timestamp of the last presence event for this user.
    pub last_seen_ms: u64,
}

/// One currently-typing remote user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingUser {
    pub user_id: String,
    pub user_name: String,
}

#[derive(Debug, Clone)]
struct TypingEntry {
    user_name: String,
    expires_at_ms: u64,
}

/// Tracks the online set and the auto-expiring typing set for one
/// conversation view.
///
/// The clock is injected as a `now_ms` parameter so expiry is
/// deterministic; expired typing entries are swept on read, independent
/// of whether a stop event ever arrives.
#[derive(Debug, Clone)]
pub struct PresenceTracker {
    local_user_id: String,
    typing_ttl_ms: u64,
    online: HashMap<String, PresenceInfo>,
    typing: HashMap<String, TypingEntry>,
}

impl PresenceTracker {
    pub fn new(local_user_id: impl Into<String>) -> Self {
        Self::with_ttl(local_user_id, DEFAULT_TYPING_TTL_MS)
    }

    pub fn with_ttl(local_user_id: impl Into<String>, typing_ttl_ms: u64) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            typing_ttl_ms: typing_ttl_ms.max(1),
            online: HashMap::new(),
            typing: HashMap::new(),
        }
    }

    /// Route one inbound presence/typing event. Other kinds are ignored.
    pub fn apply(&mut self, event: &ServerEvent, now_ms: u64) {
        match event {
            ServerEvent::UserOnline { user_id } => self.on_online(user_id, now_ms),
            ServerEvent::UserOffline { user_id } => self.on_offline(user_id, now_ms),
            ServerEvent::UserTypingStart { user_id, user_name } => {
                self.on_typing_start(user_id, user_name.as_deref(), now_ms)
            }
            ServerEvent::UserTypingStop { user_id } => self.on_typing_stop(user_id),
            _ => {}
        }
    }

    /// Mark a user online. Last writer wins per user id.
    pub fn on_online(&mut self, user_id: &str, now_ms: u64) {
        if user_id == self.local_user_id {
            return;
        }
        self.online.insert(
            user_id.to_owned(),
            PresenceInfo {
                is_online: true,
                last_seen_ms: now_ms,
            },
        );
    }

    /// Mark a user offline; a disappearing user also stops typing.
    pub fn on_offline(&mut self, user_id: &str, now_ms: u64) {
        if user_id == self.local_user_id {
            return;
        }
        self.online.insert(
            user_id.to_owned(),
            PresenceInfo {
                is_online: false,
                last_seen_ms: now_ms,
            },
        );
        self.typing.remove(user_id);
    }

    /// Insert or refresh a typing indicator, expiring at `now + TTL`.
    pub fn on_typing_start(&mut self, user_id: &str, user_name: Option<&str>, now_ms: u64) {
        if user_id == self.local_user_id {
            trace!(%user_id, "ignoring local user's own typing event");
            return;
        }
        self.typing.insert(
            user_id.to_owned(),
            TypingEntry {
                user_name: user_name.unwrap_or(user_id).to_owned(),
                expires_at_ms: now_ms.saturating_add(self.typing_ttl_ms),
            },
        );
    }

    /// Remove a typing indicator immediately, pre-empting TTL expiry.
    pub fn on_typing_stop(&mut self, user_id: &str) {
        self.typing.remove(user_id);
    }

    /// Whether the user is currently online.
    pub fn is_online(&self, user_id: &str) -> bool {
        self.online
            .get(user_id)
            .is_some_and(|info| info.is_online)
    }

    /// Presence record for one user, when any event was seen for them.
    pub fn presence(&self, user_id: &str) -> Option<PresenceInfo> {
        self.online.get(user_id).copied()
    }

    /// Online user ids, sorted for stable display.
    pub fn online_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self
            .online
            .iter()
            .filter(|(_, info)| info.is_online)
            .map(|(user_id, _)| user_id.clone())
            .collect();
        users.sort_unstable();
        users
    }

    /// Currently-typing users, sweeping entries whose TTL has passed.
    pub fn typing_users(&mut self, now_ms: u64) -> Vec<TypingUser> {
        self.typing.retain(|_, entry| entry.expires_at_ms > now_ms);
        let mut users: Vec<TypingUser> = self
            .typing
            .iter()
            .map(|(user_id, entry)| TypingUser {
                user_id: user_id.clone(),
                user_name: entry.user_name.clone(),
            })
            .collect();
        users.sort_unstable_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }

    /// Drop all typing indicators. Used when the view is torn down.
    pub fn clear_typing(&mut self) {
        self.typing.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typing_entry_expires_without_a_stop_event() {
        let mut tracker = PresenceTracker::with_ttl("u-me", 3_000);
        tracker.on_typing_start("u2", Some("Dr. Ross"), 10_000);

        let typing = tracker.typing_users(12_999);
        assert_eq!(typing.len(), 1);
        assert_eq!(typing[0].user_name, "Dr. Ross");

        assert!(tracker.typing_users(13_000).is_empty());
    }

    #[test]
    fn stop_event_preempts_ttl() {
        let mut tracker = PresenceTracker::with_ttl("u-me", 3_000);
        tracker.on_typing_start("u2", None, 10_000);
        tracker.on_typing_stop("u2");
        assert!(tracker.typing_users(10_001).is_empty());
    }

    #[test]
    fn typing_refresh_extends_expiry() {
        let mut tracker = PresenceTracker::with_ttl("u-me", 3_000);
        tracker.on_typing_start("u2", None, 10_000);
        tracker.on_typing_start("u2", None, 12_000);
        assert_eq!(tracker.typing_users(14_000).len(), 1);
        assert!(tracker.typing_users(15_000).is_empty());
    }

    #[test]
    fn local_user_events_are_ignored() {
        let mut tracker = PresenceTracker::new("u-me");
        tracker.on_typing_start("u-me", Some("Me"), 10_000);
        tracker.on_online("u-me", 10_000);

        assert!(tracker.typing_users(10_001).is_empty());
        assert!(!tracker.is_online("u-me"));
    }

    #[test]
    fn presence_is_last_writer_wins() {
        let mut tracker = PresenceTracker::new("u-me");
        tracker.on_online("u2", 10_000);
        assert!(tracker.is_online("u2"));

        tracker.on_offline("u2", 11_000);
        assert!(!tracker.is_online("u2"));
        let info = tracker.presence("u2").expect("presence record");
        assert_eq!(info.last_seen_ms, 11_000);

        tracker.on_online("u2", 12_000);
        assert!(tracker.is_online("u2"));
    }

    #[test]
    fn going_offline_clears_typing() {
        let mut tracker = PresenceTracker::new("u-me");
        tracker.on_typing_start("u2", None, 10_000);
        tracker.on_offline("u2", 10_500);
        assert!(tracker.typing_users(10_600).is_empty());
    }

    #[test]
    fn routes_events_through_apply() {
        let mut tracker = PresenceTracker::new("u-me");
        tracker.apply(
            &ServerEvent::UserOnline {
                user_id: "u3".to_owned(),
            },
            10_000,
        );
        tracker.apply(
            &ServerEvent::UserTypingStart {
                user_id: "u3".to_owned(),
                user_name: None,
            },
            10_000,
        );

        assert_eq!(tracker.online_users(), ["u3".to_owned()]);
        let typing = tracker.typing_users(10_100);
        assert_eq!(typing[0].user_id, "u3");
        // Wire payload had no name; the id stands in.
        assert_eq!(typing[0].user_name, "u3");
    }
}
