//! Observable cells
//!
//! An [`ObservableCell<T>`] holds exactly one current value and a list of
//! keyed subscribers. It is the minimal reactive primitive the rest of Hoard
//! is built on.
//!
//! - `subscribe` replays the current value to the new callback before it
//!   returns (replay-of-one), which is what separates a cell from a plain
//!   event emitter.
//! - `update` sets the value and notifies every subscriber in registration
//!   order before returning. A failing or panicking subscriber is reported
//!   through the cell's [`ErrorReporter`](crate::report::ErrorReporter) and
//!   does not stop the others.
//! - No lock is held while subscribers run, so callbacks may read, write,
//!   or subscribe to any cell, including the one notifying them, from any
//!   thread.
//! - One thread at a time notifies a given cell. A write from another
//!   thread during that round is committed and handed over: its `update`
//!   returns right away and the notifying thread fans out the latest value
//!   once its current round ends.
//! - [`ObservableCell::exclusive`] is the one place a lock spans callbacks:
//!   writes from other threads wait until its closure returns.
//!
//! # Example
//!
//! ```rust
//! use hoard_core::ObservableCell;
//! use std::sync::{Arc, Mutex};
//!
//! let cell = ObservableCell::named("counter", 1);
//! let seen = Arc::new(Mutex::new(Vec::new()));
//!
//! let seen_clone = seen.clone();
//! let sub = cell.subscribe("logger", move |v: &i32| seen_clone.lock().unwrap().push(*v));
//!
//! cell.update(2).unwrap();
//! sub.unsubscribe();
//! cell.update(3).unwrap();
//!
//! assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
//! ```

use crate::error::{CellError, Result};
use crate::events::{CellEvent, EventBus, EventKind};
use crate::report::{default_reporter, SharedReporter};
use crate::subscribers::{dispatch, Callback, SubscriberList, Subscription};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

/// Bound for values stored in cells
pub trait CellValue: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> CellValue for T {}

/// Observer invoked after every `update`, used by persistence
pub type WriteHook<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct CellState<T> {
    value: T,
    /// Bumped on every write
    version: u64,
    disposed: bool,
}

struct CellInner<T> {
    key: String,
    state: RwLock<CellState<T>>,
    subscribers: Mutex<SubscriberList<T>>,
    events: EventBus<CellEvent<T>>,
    emit_events: AtomicBool,
    write_hook: RwLock<Option<WriteHook<T>>>,
    /// Serializes commits; held across callbacks only by `exclusive`
    writes: ReentrantMutex<()>,
    delivery: Mutex<Delivery>,
    reporter: SharedReporter,
}

/// Which thread is notifying subscribers, and whether a write arrived
/// from another thread meanwhile
#[derive(Default)]
struct Delivery {
    owner: Option<ThreadId>,
    pending: bool,
}

/// Clears the delivery owner if the fan-out unwinds
struct OwnerGuard<'a> {
    delivery: &'a Mutex<Delivery>,
    thread: ThreadId,
}

impl Drop for OwnerGuard<'_> {
    fn drop(&mut self) {
        let mut delivery = self.delivery.lock();
        if delivery.owner == Some(self.thread) {
            delivery.owner = None;
        }
    }
}

/// How a committed value is announced
#[derive(Clone, Copy)]
enum Publish {
    /// Subscribers, `ValueUpdated` and the write hook
    Update,
    /// Subscribers only; the hook too when local writes are buffered
    Loaded { feed_hook: bool },
}

/// A single mutable value with keyed subscribers
///
/// Cloning is cheap and yields a handle to the same cell.
pub struct ObservableCell<T> {
    inner: Arc<CellInner<T>>,
}

impl<T> Clone for ObservableCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: CellValue> ObservableCell<T> {
    /// Create a local cell
    pub fn new(value: T) -> Self {
        Self::named("local", value)
    }

    /// Create a cell with a name used in events and error reports
    pub fn named(key: impl Into<String>, value: T) -> Self {
        Self::with_reporter(key, value, default_reporter())
    }

    /// Create a named cell that reports subscriber failures to `reporter`
    pub fn with_reporter(key: impl Into<String>, value: T, reporter: SharedReporter) -> Self {
        let key = key.into();
        Self {
            inner: Arc::new(CellInner {
                events: EventBus::with_reporter(key.clone(), reporter.clone()),
                key,
                state: RwLock::new(CellState {
                    value,
                    version: 0,
                    disposed: false,
                }),
                subscribers: Mutex::new(SubscriberList::new()),
                emit_events: AtomicBool::new(false),
                write_hook: RwLock::new(None),
                writes: ReentrantMutex::new(()),
                delivery: Mutex::new(Delivery::default()),
                reporter,
            }),
        }
    }

    /// Name used in events, logs and error reports
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Current value
    pub fn get(&self) -> T {
        self.inner.state.read().value.clone()
    }

    /// Read the current value without cloning it
    ///
    /// `f` runs under the cell's read lock and must not write to this cell.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.state.read().value)
    }

    /// Number of writes since creation
    pub fn version(&self) -> u64 {
        self.inner.state.read().version
    }

    /// Whether [`ObservableCell::dispose`] has run
    pub fn is_disposed(&self) -> bool {
        self.inner.state.read().disposed
    }

    // =========================================================================
    // VALUE SUBSCRIBERS
    // =========================================================================

    /// Register `callback` under `id` and call it once with the current value
    ///
    /// Subscribing again under an existing id replaces that callback.
    pub fn subscribe<F>(&self, id: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.insert_subscriber(
            id.into(),
            Arc::new(move |value: &T| {
                callback(value);
                Ok(())
            }),
        )
    }

    /// Like [`ObservableCell::subscribe`] for callbacks that can fail
    pub fn try_subscribe<F>(&self, id: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.insert_subscriber(id.into(), Arc::new(callback))
    }

    fn insert_subscriber(&self, id: String, callback: Callback<T>) -> Subscription {
        self.inner
            .subscribers
            .lock()
            .insert(id.clone(), callback.clone());

        let value = self.get();
        dispatch(
            &self.inner.key,
            &[(id.clone(), callback)],
            &value,
            self.inner.reporter.as_ref(),
        );

        let weak = Arc::downgrade(&self.inner);
        let handle_id = id.clone();
        Subscription::new(id, move || {
            if let Some(inner) = weak.upgrade() {
                inner.subscribers.lock().remove(&handle_id);
            }
        })
    }

    /// Remove the subscriber registered under `id`; unknown ids are ignored
    pub fn unsubscribe(&self, id: &str) {
        self.inner.subscribers.lock().remove(id);
    }

    /// Number of value subscribers
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    // =========================================================================
    // WRITES
    // =========================================================================

    /// Set a new value and notify every subscriber
    pub fn update(&self, value: T) -> Result<()> {
        self.stage(value)?;
        self.publish();
        Ok(())
    }

    /// Compute the new value from the current one, then notify
    ///
    /// `f` runs under the write lock and must not write to this cell from
    /// another thread.
    pub fn update_with(&self, f: impl FnOnce(&T) -> T) -> Result<()> {
        {
            let _writes = self.inner.writes.lock();
            let next = f(&self.get());
            self.stage(next)?;
        }
        self.publish();
        Ok(())
    }

    /// Run `f` while holding this cell's write lock
    ///
    /// Writes from other threads wait until `f` returns; writes made by `f`
    /// itself go through and notify as usual. Groups several writes into
    /// one step. Subscribers notified inside `f` must not wait on another
    /// thread's `exclusive` section.
    pub fn exclusive<R>(&self, f: impl FnOnce() -> R) -> R {
        let _writes = self.inner.writes.lock();
        f()
    }

    /// Set the value without notifying anyone
    ///
    /// Pair with [`ObservableCell::publish`] to commit several cells before
    /// any of them notifies.
    pub fn stage(&self, value: T) -> Result<()> {
        let _writes = self.inner.writes.lock();
        let mut state = self.inner.state.write();
        if state.disposed {
            return Err(CellError::Disposed(self.inner.key.clone()));
        }
        state.value = value;
        state.version += 1;
        Ok(())
    }

    /// Notify subscribers of the current value as an ordinary update
    ///
    /// Emits `ValueUpdated` when events are enabled and feeds the write hook.
    pub fn publish(&self) {
        self.deliver(Publish::Update);
    }

    /// Replace the value with one read from storage
    ///
    /// Subscribers see the transition like any update. The write hook is
    /// skipped so the loaded value is not written straight back, unless the
    /// cell was written since `attached_version`: then the hook gets the
    /// loaded value too, replacing the local value still queued for storage.
    pub fn apply_loaded(&self, value: T, attached_version: u64) -> Result<()> {
        let written_locally = {
            let _writes = self.inner.writes.lock();
            let mut state = self.inner.state.write();
            if state.disposed {
                return Err(CellError::Disposed(self.inner.key.clone()));
            }
            let written_locally = state.version != attached_version;
            state.value = value;
            state.version += 1;
            written_locally
        };
        self.deliver(Publish::Loaded {
            feed_hook: written_locally,
        });
        Ok(())
    }

    /// Fan out the current value, or hand it to the thread already doing so
    fn deliver(&self, publish: Publish) {
        let me = thread::current().id();
        {
            let mut delivery = self.inner.delivery.lock();
            match delivery.owner {
                // Nested write from a subscriber on the notifying thread
                Some(owner) if owner == me => {
                    drop(delivery);
                    self.fan_out(publish);
                    return;
                }
                Some(_) => {
                    delivery.pending = true;
                    return;
                }
                None => delivery.owner = Some(me),
            }
        }

        let _guard = OwnerGuard {
            delivery: &self.inner.delivery,
            thread: me,
        };
        let mut next = publish;
        loop {
            self.fan_out(next);
            let mut delivery = self.inner.delivery.lock();
            if !std::mem::take(&mut delivery.pending) {
                delivery.owner = None;
                return;
            }
            next = Publish::Update;
        }
    }

    fn fan_out(&self, publish: Publish) {
        if self.is_disposed() {
            return;
        }
        let value = self.get();
        self.notify(&value);

        let feed_hook = match publish {
            Publish::Update => {
                if self.emits_events() {
                    let event = CellEvent::new(EventKind::ValueUpdated, self.inner.key.clone())
                        .with_value(value.clone());
                    self.inner.events.emit(&event);
                }
                true
            }
            Publish::Loaded { feed_hook } => feed_hook,
        };

        if feed_hook {
            let hook = self.inner.write_hook.read().clone();
            if let Some(hook) = hook {
                hook(&value);
            }
        }
    }

    fn notify(&self, value: &T) {
        let snapshot = self.inner.subscribers.lock().snapshot();
        let failures = dispatch(
            &self.inner.key,
            &snapshot,
            value,
            self.inner.reporter.as_ref(),
        );
        if failures > 0 {
            tracing::debug!(
                key = %self.inner.key,
                failures,
                subscribers = snapshot.len(),
                "fan-out completed with failures"
            );
        }
    }

    // =========================================================================
    // EVENTS
    // =========================================================================

    /// Turn `ValueUpdated` emission on or off
    pub fn set_emit_events(&self, enabled: bool) {
        self.inner.emit_events.store(enabled, Ordering::SeqCst);
    }

    /// Whether `update` emits `ValueUpdated`
    pub fn emits_events(&self) -> bool {
        self.inner.emit_events.load(Ordering::SeqCst)
    }

    /// Listen for lifecycle events under `id`; no replay
    pub fn subscribe_events<F>(&self, id: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&CellEvent<T>) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(id, callback)
    }

    /// Remove the event listener registered under `id`
    pub fn unsubscribe_events(&self, id: &str) {
        self.inner.events.unsubscribe(id);
    }

    /// Deliver `event` to every event listener
    pub fn emit_event(&self, event: CellEvent<T>) {
        self.inner.events.emit(&event);
    }

    /// The lifecycle event channel
    pub fn events(&self) -> &EventBus<CellEvent<T>> {
        &self.inner.events
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Install the observer called after every `update`, replacing any other
    pub fn set_write_hook(&self, hook: WriteHook<T>) {
        *self.inner.write_hook.write() = Some(hook);
    }

    /// Remove the write hook; later writes stay in memory
    pub fn clear_write_hook(&self) {
        self.inner.write_hook.write().take();
    }

    /// Whether a write hook is installed
    pub fn has_write_hook(&self) -> bool {
        self.inner.write_hook.read().is_some()
    }

    /// Clear every subscriber and the write hook, and reject further writes
    ///
    /// The last value stays readable.
    pub fn dispose(&self) {
        {
            let _writes = self.inner.writes.lock();
            self.inner.state.write().disposed = true;
        }
        self.inner.subscribers.lock().clear();
        self.inner.events.clear();
        self.clear_write_hook();
        tracing::debug!(key = %self.inner.key, "cell disposed");
    }

    /// Where subscriber failures go
    pub fn reporter(&self) -> &SharedReporter {
        &self.inner.reporter
    }

    /// Whether both handles point to the same cell
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Handle that does not keep the cell alive
    pub fn downgrade(&self) -> WeakCell<T> {
        WeakCell {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl<T: CellValue + fmt::Debug> fmt::Debug for ObservableCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("ObservableCell")
            .field("key", &self.inner.key)
            .field("value", &state.value)
            .field("version", &state.version)
            .field("disposed", &state.disposed)
            .finish()
    }
}

/// Non-owning handle to a cell, used by background tasks
pub struct WeakCell<T> {
    inner: Weak<CellInner<T>>,
}

impl<T> Clone for WeakCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> WeakCell<T> {
    /// The cell, if any strong handle is left
    pub fn upgrade(&self) -> Option<ObservableCell<T>> {
        self.inner.upgrade().map(|inner| ObservableCell { inner })
    }
}
