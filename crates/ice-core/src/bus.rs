//! Ordered, synchronous fan-out of events to registered handlers.
//!
//! Handlers are stored in subscription order and addressed by a small integer
//! [`SubscriptionId`]. [`NotificationBus::publish`] delivers to a snapshot of
//! the handler list, so handlers may subscribe or unsubscribe (themselves or
//! others) while an event is in flight without affecting that delivery.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct HandlerList<T> {
    next_id: u64,
    entries: Vec<(SubscriptionId, Handler<T>)>,
}

pub struct NotificationBus<T> {
    handlers: Mutex<HandlerList<T>>,
}

impl<T> Default for NotificationBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> NotificationBus<T> {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HandlerList {
                next_id: 0,
                entries: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HandlerList<T>> {
        // handlers never run under this lock, a poisoned list is still consistent
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let mut list = self.lock();
        list.next_id += 1;
        let id = SubscriptionId(list.next_id);
        list.entries.push((id, Arc::new(handler)));
        id
    }

    /// Removes a handler. Returns `false` when the id is unknown or was already
    /// removed; calling it again is harmless.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut list = self.lock();
        match list.entries.iter().position(|(entry_id, _)| *entry_id == id) {
            Some(index) => {
                list.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Delivers `event` to every handler registered at the time of the call, in
    /// subscription order. A panicking handler is logged and skipped; the rest
    /// still receive the event. Returns the number of handlers that completed.
    pub fn publish(&self, event: &T) -> usize {
        let snapshot: Vec<Handler<T>> = self
            .lock()
            .entries
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        let mut delivered = 0;
        for handler in snapshot {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|value| value.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown".to_string());
                    warn!(event = "handler_panicked", reason = %reason);
                }
            }
        }
        delivered
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
