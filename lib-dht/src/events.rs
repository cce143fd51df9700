//! Event bus
//!
//! Named-event subscription lists with synchronous FIFO delivery. Events are
//! emitted after the state change they describe and are never re-ordered
//! relative to one subscriber.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Event handler callback.
pub type EventHandler = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;

/// Well-known event names emitted by the core.
pub mod names {
    pub const STARTED: &str = "started";
    pub const STOPPED: &str = "stopped";
    pub const ERROR: &str = "error";
    pub const PEER_CONNECT: &str = "peer:connect";
    pub const PEER_DISCONNECT: &str = "peer:disconnect";
    pub const MESSAGE_RECEIVED: &str = "message:received";
    pub const MESSAGE_SENT: &str = "message:sent";
    pub const STORED: &str = "stored";
    pub const RETRIEVED: &str = "retrieved";
    pub const DELETED: &str = "deleted";
    pub const REPLICATED: &str = "replicated";
    pub const REPLICATION_FAILED: &str = "replication-failed";
    pub const CONTENT_PUBLISHED: &str = "content:published";
    pub const VERSION_CREATED: &str = "version:created";
}

/// Subscription registry, cheap to clone and share.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<RwLock<HashMap<String, Vec<EventHandler>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a named event.
    pub fn subscribe(&self, event: &str, handler: EventHandler) {
        self.subscribers
            .write()
            .expect("event bus lock poisoned")
            .entry(event.to_string())
            .or_default()
            .push(handler);
    }

    /// Deliver an event to every subscriber in registration order.
    pub fn emit(&self, event: &str, payload: serde_json::Value) {
        let handlers: Vec<EventHandler> = {
            let subscribers = self.subscribers.read().expect("event bus lock poisoned");
            match subscribers.get(event) {
                Some(list) => list.clone(),
                None => return,
            }
        };
        for handler in handlers {
            handler(&payload);
        }
    }

    /// Number of subscribers for an event.
    pub fn subscriber_count(&self, event: &str) -> usize {
        self.subscribers
            .read()
            .expect("event bus lock poisoned")
            .get(event)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count: usize = self
            .subscribers
            .read()
            .map(|s| s.values().map(Vec::len).sum())
            .unwrap_or(0);
        f.debug_struct("EventBus").field("handlers", &count).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn test_emit_reaches_subscriber() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        bus.subscribe(
            names::STORED,
            Arc::new(move |_| {
                hits2.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bus.emit(names::STORED, json!({"id": "x"}));
        bus.emit(names::RETRIEVED, json!({"id": "x"}));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delivery_is_fifo_per_subscriber() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        bus.subscribe(
            "e",
            Arc::new(move |payload| {
                seen2.lock().unwrap().push(payload["n"].as_u64().unwrap());
            }),
        );

        for n in 0..5u64 {
            bus.emit("e", json!({ "n": n }));
        }
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_multiple_subscribers_in_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let order2 = order.clone();
            bus.subscribe(
                "e",
                Arc::new(move |_| {
                    order2.lock().unwrap().push(tag);
                }),
            );
        }
        bus.emit("e", json!(null));
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(bus.subscriber_count("e"), 2);
    }
}
