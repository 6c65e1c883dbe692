use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use tracing::warn;

use crate::types::{ServerEvent, ServerEventKind};

/// Boxed handler invoked for each dispatched event of the subscribed kind.
///
/// Handlers must not call back into the registry that invokes them;
/// dispatch holds the registry lock.
pub type EventHandler = Box<dyn FnMut(&ServerEvent) + Send>;

/// Proof of a subscription, consumed by [`EventSubscriptionRegistry::unsubscribe`].
#[derive(Debug, PartialEq, Eq)]
pub struct SubscriptionToken {
    kind: ServerEventKind,
    id: u64,
}

impl SubscriptionToken {
    /// Event kind this token subscribes to.
    pub fn kind(&self) -> ServerEventKind {
        self.kind
    }
}

struct HandlerEntry {
    id: u64,
    handler: EventHandler,
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    handlers: HashMap<ServerEventKind, Vec<HandlerEntry>>,
}

/// Typed publish/subscribe over one push channel's inbound events.
///
/// Dispatch and unsubscription serialize on the same lock, so a handler
/// is guaranteed not to fire for any event dispatched after
/// `unsubscribe` returns. Subscriptions do not survive the channel they
/// belong to; owners re-subscribe after a channel is recreated.
#[derive(Default)]
pub struct EventSubscriptionRegistry {
    inner: Mutex<RegistryInner>,
}

impl EventSubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event kind.
    pub fn subscribe(
        &self,
        kind: ServerEventKind,
        handler: EventHandler,
    ) -> SubscriptionToken {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner
            .handlers
            .entry(kind)
            .or_default()
            .push(HandlerEntry { id, handler });
        SubscriptionToken { kind, id }
    }

    /// Remove a subscription. The handler will not be invoked for any
    /// event dispatched after this call returns.
    ///
    /// Returns `false` when the token was already removed (for example
    /// by [`Self::clear`]).
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut inner = self.lock();
        let Some(entries) = inner.handlers.get_mut(&token.kind) else {
            warn!(kind = ?token.kind, "unsubscribe for unknown event kind");
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.id != token.id);
        before != entries.len()
    }

    /// Fan one inbound event out to the handlers registered for its kind.
    ///
    /// Returns the number of handlers invoked.
    pub fn dispatch(&self, event: &ServerEvent) -> usize {
        let mut inner = self.lock();
        let Some(entries) = inner.handlers.get_mut(&event.kind()) else {
            return 0;
        };
        for entry in entries.iter_mut() {
            (entry.handler)(event);
        }
        entries.len()
    }

    /// Drop every subscription. Used on channel teardown.
    pub fn clear(&self) {
        self.lock().handlers.clear();
    }

    /// Number of live subscriptions across all kinds.
    pub fn subscription_count(&self) -> usize {
        self.lock().handlers.values().map(Vec::len).sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    fn typing_event(user_id: &str) -> ServerEvent {
        ServerEvent::UserTypingStart {
            user_id: user_id.to_owned(),
            user_name: None,
        }
    }

    #[test]
    fn dispatches_only_to_matching_kind() {
        let registry = EventSubscriptionRegistry::new();
        let typing_hits = Arc::new(AtomicUsize::new(0));
        let presence_hits = Arc::new(AtomicUsize::new(0));

        let typing_counter = typing_hits.clone();
        registry.subscribe(
            ServerEventKind::TypingStart,
            Box::new(move |_| {
                typing_counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let presence_counter = presence_hits.clone();
        registry.subscribe(
            ServerEventKind::PresenceOnline,
            Box::new(move |_| {
                presence_counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert_eq!(registry.dispatch(&typing_event("u2")), 1);
        assert_eq!(typing_hits.load(Ordering::SeqCst), 1);
        assert_eq!(presence_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unsubscribed_handler_never_fires_again() {
        let registry = EventSubscriptionRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        let token = registry.subscribe(
            ServerEventKind::TypingStart,
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        registry.dispatch(&typing_event("u2"));
        assert!(registry.unsubscribe(token));
        registry.dispatch(&typing_event("u2"));
        registry.dispatch(&typing_event("u3"));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clear_drops_all_subscriptions() {
        let registry = EventSubscriptionRegistry::new();
        registry.subscribe(ServerEventKind::NewMessage, Box::new(|_| {}));
        let token = registry.subscribe(ServerEventKind::MessageRead, Box::new(|_| {}));
        assert_eq!(registry.subscription_count(), 2);

        registry.clear();
        assert_eq!(registry.subscription_count(), 0);
        assert!(!registry.unsubscribe(token));
    }

    #[test]
    fn handler_receives_the_event_payload() {
        let registry = EventSubscriptionRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        registry.subscribe(
            ServerEventKind::PresenceOffline,
            Box::new(move |event| {
                if let ServerEvent::UserOffline { user_id } = event {
                    sink.lock().expect("lock").push(user_id.clone());
                }
            }),
        );

        registry.dispatch(&ServerEvent::UserOffline {
            user_id: "u7".to_owned(),
        });
        assert_eq!(seen.lock().expect("lock").as_slice(), ["u7".to_owned()]);
    }
}
