//! Lifecycle event channel
//!
//! Every cell carries an [`EventBus`] next to its value subscribers. The value
//! channel says "the in-memory value changed"; the event channel says what
//! happened around it: the value was loaded from storage, durably persisted,
//! or an error occurred. Once persistence is debounced these are not
//! simultaneous, so they travel on separate channels.
//!
//! Unlike value subscribers, event subscribers get no replay on subscribe.

use crate::report::{default_reporter, SharedReporter};
use crate::subscribers::{dispatch, Callback, SubscriberList, Subscription};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::SystemTime;

/// Kind of a cell lifecycle event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Hydration finished, with or without a stored value
    InitialLoadComplete,
    /// The in-memory value changed through `update`
    ValueUpdated,
    /// A debounced write reached the storage backend
    Persisted,
    /// A stored value replaced the initial value
    LoadedFromStorage,
    /// Configuration or storage failure
    Error,
}

/// A tagged lifecycle event for one cell
#[derive(Clone, Debug)]
pub struct CellEvent<T> {
    pub kind: EventKind,
    /// Registry key (or local name) of the cell
    pub key: String,
    pub value: Option<T>,
    pub timestamp: SystemTime,
    pub error: Option<String>,
}

impl<T> CellEvent<T> {
    pub fn new(kind: EventKind, key: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
            value: None,
            timestamp: SystemTime::now(),
            error: None,
        }
    }

    pub fn with_value(mut self, value: T) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

struct BusInner<E> {
    key: String,
    subscribers: Mutex<SubscriberList<E>>,
    reporter: SharedReporter,
}

/// Keyed subscribers for a stream of events of type `E`
///
/// Cheap to clone; clones share the same subscriber list.
pub struct EventBus<E> {
    inner: Arc<BusInner<E>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: Send + Sync + 'static> EventBus<E> {
    pub fn new(key: impl Into<String>) -> Self {
        Self::with_reporter(key, default_reporter())
    }

    pub fn with_reporter(key: impl Into<String>, reporter: SharedReporter) -> Self {
        Self {
            inner: Arc::new(BusInner {
                key: key.into(),
                subscribers: Mutex::new(SubscriberList::new()),
                reporter,
            }),
        }
    }

    /// Register `callback` under `id`, replacing any previous callback for `id`
    pub fn subscribe<F>(&self, id: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.insert(
            id.into(),
            Arc::new(move |event: &E| {
                callback(event);
                Ok(())
            }),
        )
    }

    /// Like [`EventBus::subscribe`] for callbacks that can fail
    pub fn try_subscribe<F>(&self, id: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.insert(id.into(), Arc::new(callback))
    }

    fn insert(&self, id: String, callback: Callback<E>) -> Subscription {
        self.inner.subscribers.lock().insert(id.clone(), callback);
        let weak: Weak<BusInner<E>> = Arc::downgrade(&self.inner);
        let handle_id = id.clone();
        Subscription::new(id, move || {
            if let Some(inner) = weak.upgrade() {
                inner.subscribers.lock().remove(&handle_id);
            }
        })
    }

    pub fn unsubscribe(&self, id: &str) {
        self.inner.subscribers.lock().remove(id);
    }

    /// Deliver `event` to every subscriber in registration order
    pub fn emit(&self, event: &E) {
        let snapshot = self.inner.subscribers.lock().snapshot();
        dispatch(&self.inner.key, &snapshot, event, self.inner.reporter.as_ref());
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    pub fn clear(&self) {
        self.inner.subscribers.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_do_not_replay() {
        let bus: EventBus<CellEvent<i32>> = EventBus::new("counter");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = seen.clone();
        let sub = bus.subscribe("log", move |e: &CellEvent<i32>| {
            seen_clone.lock().push((e.kind, e.value));
        });
        assert!(seen.lock().is_empty());

        bus.emit(&CellEvent::new(EventKind::ValueUpdated, "counter").with_value(3));
        bus.emit(&CellEvent::new(EventKind::Persisted, "counter").with_value(3));
        assert_eq!(
            *seen.lock(),
            vec![
                (EventKind::ValueUpdated, Some(3)),
                (EventKind::Persisted, Some(3))
            ]
        );

        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_error_event_carries_message() {
        let event: CellEvent<()> =
            CellEvent::new(EventKind::Error, "prefs").with_error("disk full");
        assert_eq!(event.error.as_deref(), Some("disk full"));
        assert!(event.value.is_none());
    }
}
