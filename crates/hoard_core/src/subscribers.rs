//! Keyed subscriber lists and the fan-out loop shared by cells and event buses

use crate::error::CellError;
use crate::report::ErrorReporter;
use smallvec::SmallVec;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// A subscriber callback. Infallible callbacks are wrapped to return `Ok(())`.
pub type Callback<V> = Arc<dyn Fn(&V) -> anyhow::Result<()> + Send + Sync>;

/// Snapshot of a subscriber list taken before dispatching
pub(crate) type Snapshot<V> = SmallVec<[(String, Callback<V>); 4]>;

/// Subscriber records in registration order
pub(crate) struct SubscriberList<V> {
    entries: SmallVec<[(String, Callback<V>); 4]>,
}

impl<V> SubscriberList<V> {
    pub(crate) fn new() -> Self {
        Self {
            entries: SmallVec::new(),
        }
    }

    /// Insert or replace the callback under `id`
    ///
    /// A replaced callback keeps its original position. Returns `true` when
    /// an existing record was replaced.
    pub(crate) fn insert(&mut self, id: String, callback: Callback<V>) -> bool {
        if let Some(slot) = self.entries.iter_mut().find(|(existing, _)| *existing == id) {
            slot.1 = callback;
            return true;
        }
        self.entries.push((id, callback));
        false
    }

    pub(crate) fn remove(&mut self, id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(existing, _)| existing != id);
        before != self.entries.len()
    }

    pub(crate) fn snapshot(&self) -> Snapshot<V> {
        self.entries.clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Invoke every callback with `value`, reporting failures independently
///
/// Returns the number of callbacks that failed.
pub(crate) fn dispatch<V>(
    key: &str,
    subscribers: &[(String, Callback<V>)],
    value: &V,
    reporter: &dyn ErrorReporter,
) -> usize {
    let mut failures = 0;
    for (id, callback) in subscribers {
        match catch_unwind(AssertUnwindSafe(|| callback(value))) {
            Ok(Ok(())) => {}
            Ok(Err(source)) => {
                failures += 1;
                reporter.report(CellError::Callback {
                    key: key.to_string(),
                    subscriber: id.clone(),
                    source,
                });
            }
            Err(payload) => {
                failures += 1;
                reporter.report(CellError::Panicked {
                    key: key.to_string(),
                    subscriber: id.clone(),
                    message: panic_message(payload.as_ref()),
                });
            }
        }
    }
    failures
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Handle that removes one subscription
///
/// Calling [`Subscription::unsubscribe`] more than once, or after the owner
/// has been dropped or disposed, is a no-op. Dropping the handle does not
/// unsubscribe.
#[derive(Clone)]
pub struct Subscription {
    id: String,
    remove: Arc<dyn Fn() + Send + Sync>,
}

impl Subscription {
    /// Create a handle from an id and the closure that removes it
    pub fn new(id: impl Into<String>, remove: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            id: id.into(),
            remove: Arc::new(remove),
        }
    }

    /// Subscriber id this handle removes
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn unsubscribe(&self) {
        (self.remove)();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
