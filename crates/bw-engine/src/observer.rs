//! Change notification
//!
//! Topics are engine names (and [`crate::exceptions::EXCEPTIONS_TOPIC`]).
//! Notifications carry no payload: handlers re-read current state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

type Handler = Arc<dyn Fn(&str) + Send + Sync>;
type HandlerMap = Mutex<HashMap<String, Vec<(u64, Handler)>>>;

/// Typed observer registry keyed by topic.
#[derive(Default)]
pub struct Observers {
    next_id: AtomicU64,
    handlers: Arc<HandlerMap>,
}

/// Handle returned by [`Observers::subscribe`]. Dropping it keeps the handler
/// registered; call [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    topic: String,
    id: u64,
    handlers: Weak<HandlerMap>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        let Some(handlers) = self.handlers.upgrade() else {
            return;
        };
        let mut handlers = handlers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(list) = handlers.get_mut(&self.topic) {
            list.retain(|(id, _)| *id != self.id);
            if list.is_empty() {
                handlers.remove(&self.topic);
            }
        }
    }
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, topic: &str, handler: F) -> Subscription
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_string())
            .or_default()
            .push((id, Arc::new(handler)));

        Subscription {
            topic: topic.to_string(),
            id,
            handlers: Arc::downgrade(&self.handlers),
        }
    }

    /// Call every handler of `topic` once.
    pub fn notify(&self, topic: &str) {
        // Handlers run outside the lock so they may subscribe or unsubscribe.
        let handlers: Vec<Handler> = {
            let map = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
            match map.get(topic) {
                Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
                None => return,
            }
        };

        for handler in handlers {
            handler(topic);
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map_or(0, Vec::len)
    }
}
