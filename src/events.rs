//! Session event bus
//!
//! Decoupled one-to-many notification between the session manager and its
//! collaborators (CLI commands, future UI). Fan-out is synchronous and in
//! subscription order; a panicking handler never blocks delivery to the
//! handlers behind it.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Events emitted by the session manager
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// An account was forced to logged-out state (expired/revoked credential,
    /// or the last account was logged out). `did` is the account that was
    /// dropped, when a single one can be named.
    SessionDropped {
        /// The dropped account, if a single one can be named
        did: Option<String>,
    },
    /// The current account changed (login or switch)
    AccountChanged {
        /// The new current account
        did: String,
    },
}

/// Kind selector for subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Matches [`SessionEvent::SessionDropped`]
    SessionDropped,
    /// Matches [`SessionEvent::AccountChanged`]
    AccountChanged,
}

impl SessionEvent {
    /// The kind of this event
    pub fn kind(&self) -> EventKind {
        match self {
            Self::SessionDropped { .. } => EventKind::SessionDropped,
            Self::AccountChanged { .. } => EventKind::AccountChanged,
        }
    }
}

type Handler = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

struct Slot {
    id: u64,
    kind: EventKind,
    handler: Handler,
}

/// Process-wide publish/subscribe channel for session events
#[derive(Default)]
pub struct EventBus {
    slots: Mutex<Vec<Slot>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create an empty bus
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a handler for one event kind.
    ///
    /// Handlers run synchronously, in subscription order. The returned
    /// [`Subscription`] unsubscribes on drop or via [`Subscription::cancel`].
    pub fn subscribe(
        self: &Arc<Self>,
        kind: EventKind,
        handler: impl Fn(&SessionEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.slots.lock().expect("event bus poisoned").push(Slot {
            id,
            kind,
            handler: Arc::new(handler),
        });
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    /// Deliver an event to every handler subscribed at call time.
    ///
    /// Each invocation is isolated: a panicking handler is logged and the
    /// remaining handlers still run.
    pub fn publish(&self, event: &SessionEvent) {
        // Snapshot under the lock, invoke outside it, so handlers may
        // subscribe/unsubscribe without deadlocking.
        let handlers: Vec<Handler> = {
            let slots = self.slots.lock().expect("event bus poisoned");
            slots
                .iter()
                .filter(|slot| slot.kind == event.kind())
                .map(|slot| Arc::clone(&slot.handler))
                .collect()
        };

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                tracing::error!("Session event handler panicked for {:?}", event.kind());
            }
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.slots
            .lock()
            .expect("event bus poisoned")
            .retain(|slot| slot.id != id);
    }
}

/// Handle to an active subscription; unsubscribes on drop
pub struct Subscription {
    bus: Weak<EventBus>,
    id: u64,
}

impl Subscription {
    /// Explicitly unsubscribe. Calling this more than once is a no-op.
    pub fn cancel(&self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dropped(did: &str) -> SessionEvent {
        SessionEvent::SessionDropped {
            did: Some(did.to_string()),
        }
    }

    #[test]
    fn test_handlers_run_in_subscription_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = {
            let seen = Arc::clone(&seen);
            bus.subscribe(EventKind::SessionDropped, move |_| {
                seen.lock().unwrap().push(1);
            })
        };
        let s2 = {
            let seen = Arc::clone(&seen);
            bus.subscribe(EventKind::SessionDropped, move |_| {
                seen.lock().unwrap().push(2);
            })
        };

        bus.publish(&dropped("did:plc:a"));
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        drop((s1, s2));
    }

    #[test]
    fn test_kind_filtering() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let _sub = {
            let seen = Arc::clone(&seen);
            bus.subscribe(EventKind::AccountChanged, move |event| {
                if let SessionEvent::AccountChanged { did } = event {
                    seen.lock().unwrap().push(did.clone());
                }
            })
        };

        bus.publish(&dropped("did:plc:a"));
        bus.publish(&SessionEvent::AccountChanged {
            did: "did:plc:b".to_string(),
        });

        assert_eq!(*seen.lock().unwrap(), vec!["did:plc:b".to_string()]);
    }

    #[test]
    fn test_panicking_handler_does_not_block_delivery() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(0));

        let _s1 = bus.subscribe(EventKind::SessionDropped, |_| {
            panic!("handler bug");
        });
        let _s2 = {
            let seen = Arc::clone(&seen);
            bus.subscribe(EventKind::SessionDropped, move |_| {
                *seen.lock().unwrap() += 1;
            })
        };

        bus.publish(&dropped("did:plc:a"));
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(0));

        let sub = {
            let seen = Arc::clone(&seen);
            bus.subscribe(EventKind::SessionDropped, move |_| {
                *seen.lock().unwrap() += 1;
            })
        };

        sub.cancel();
        sub.cancel();
        bus.publish(&dropped("did:plc:a"));
        assert_eq!(*seen.lock().unwrap(), 0);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(0));

        {
            let seen = Arc::clone(&seen);
            let _sub = bus.subscribe(EventKind::SessionDropped, move |_| {
                *seen.lock().unwrap() += 1;
            });
        }

        bus.publish(&dropped("did:plc:a"));
        assert_eq!(*seen.lock().unwrap(), 0);
    }
}
