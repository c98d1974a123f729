//! In-process publish/subscribe fanout.
//!
//! Delivery is synchronous and follows registration order. There is no
//! buffering or replay: new observers get state from the `initial-data`
//! snapshot instead.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, error};

use super::types::{EventKind, PipelineEvent};

/// Callback invoked for every matching event.
pub type EventHandler = Arc<dyn Fn(&PipelineEvent) + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Registration {
    id: SubscriptionId,
    /// `None` receives every kind.
    kind: Option<EventKind>,
    handler: EventHandler,
}

/// Typed event bus shared by the repository, the engine, and transports.
pub struct EventBus {
    subscribers: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Receive all future events of one kind.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&PipelineEvent) + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(handler))
    }

    /// Receive all future events regardless of kind.
    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&PipelineEvent) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(handler))
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|r| r.id != id);
        let removed = subscribers.len() != before;
        if removed {
            debug!(subscription = id.0, "Event subscription removed");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Deliver `event` to every matching subscriber, in registration order.
    ///
    /// A panicking handler is logged and skipped; the rest still run.
    /// Returns the number of handlers that completed.
    pub fn publish(&self, event: PipelineEvent) -> usize {
        let kind = event.kind();

        // Handlers run outside the lock so they may (un)subscribe.
        let handlers: Vec<(SubscriptionId, EventHandler)> = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.kind.is_none_or(|k| k == kind))
            .map(|r| (r.id, Arc::clone(&r.handler)))
            .collect();

        let mut delivered = 0;
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    error!(
                        subscription = id.0,
                        event = %kind,
                        reason = %panic_message(panic.as_ref()),
                        "Event handler panicked"
                    );
                }
            }
        }
        delivered
    }

    fn register(&self, kind: Option<EventKind>, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Registration { id, kind, handler });
        debug!(subscription = id.0, kind = ?kind, "Event subscription added");
        id
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use uuid::Uuid;

    fn started() -> PipelineEvent {
        PipelineEvent::ProcessingStarted { id: Uuid::new_v4() }
    }

    #[test]
    fn delivers_in_registration_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for n in 0..3 {
            let log = Arc::clone(&log);
            bus.subscribe_all(move |_| log.lock().unwrap().push(n));
        }

        assert_eq!(bus.publish(started()), 3);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn kind_filter() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(Vec::new()));

        let h = Arc::clone(&hits);
        bus.subscribe(EventKind::ProcessingUpdate, move |e| {
            h.lock().unwrap().push(e.kind())
        });

        bus.publish(started());
        bus.publish(PipelineEvent::ProcessingUpdate {
            id: Uuid::new_v4(),
            text: "a".into(),
        });

        assert_eq!(*hits.lock().unwrap(), vec![EventKind::ProcessingUpdate]);
    }

    #[test]
    fn late_subscriber_gets_no_replay() {
        let bus = EventBus::new();
        bus.publish(started());

        let count = Arc::new(Mutex::new(0));
        let c = Arc::clone(&count);
        bus.subscribe_all(move |_| *c.lock().unwrap() += 1);

        assert_eq!(*count.lock().unwrap(), 0);
        bus.publish(started());
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn panicking_handler_is_isolated() {
        let bus = EventBus::new();
        let reached = Arc::new(Mutex::new(false));

        bus.subscribe_all(|_| panic!("bad subscriber"));
        let r = Arc::clone(&reached);
        bus.subscribe_all(move |_| *r.lock().unwrap() = true);

        assert_eq!(bus.publish(started()), 1);
        assert!(*reached.lock().unwrap());

        // Bus still usable afterwards.
        assert_eq!(bus.publish(started()), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(Mutex::new(0));
        let c = Arc::clone(&count);
        let id = bus.subscribe_all(move |_| *c.lock().unwrap() += 1);

        bus.publish(started());
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(started());

        assert_eq!(*count.lock().unwrap(), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn handler_may_unsubscribe_itself() {
        let bus = EventBus::new();
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));

        let bus_ref = Arc::clone(&bus);
        let s = Arc::clone(&slot);
        let id = bus.subscribe_all(move |_| {
            if let Some(id) = s.lock().unwrap().take() {
                bus_ref.unsubscribe(id);
            }
        });
        *slot.lock().unwrap() = Some(id);

        assert_eq!(bus.publish(started()), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn panic_message_extracts_text() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn std::any::Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
