//! Keyed list projection
//!
//! A [`ListProjection`] keeps one registry cell holding the whole list and
//! one local cell per item, keyed by an id extracted from each item. Every
//! mutation leaves both sides consistent: the item cell for an id holds the
//! same value as the element with that id in the list.
//!
//! Subscribing to an id that is not in the list yet registers a waiting
//! subscriber; it is attached to the item cell the moment an item with that
//! id appears.
//!
//! All mutations run under the list cell's write lock, and the projection
//! also follows writes made to the list cell directly (for example the
//! stored value arriving after hydrate), so item cells never drift.
//!
//! # Example
//!
//! ```rust
//! use hoard_store::{ListProjection, NamedRegistry};
//!
//! #[derive(Clone, Debug, PartialEq)]
//! struct Todo {
//!     id: u32,
//!     title: String,
//! }
//!
//! let registry = NamedRegistry::new();
//! let todos = ListProjection::new(&registry, "todos", Vec::new(), |t: &Todo| t.id, None).unwrap();
//!
//! let _sub = todos.subscribe_to_item(1, "title", |todo: &Todo| println!("{}", todo.title));
//! todos.add_item(Todo { id: 1, title: "write docs".into() }).unwrap();
//! todos.update_item(&1, |t| Todo { title: "ship".into(), ..t.clone() }).unwrap();
//!
//! assert_eq!(todos.get_item(&1).unwrap().title, "ship");
//! assert_eq!(todos.len(), 1);
//! ```

use crate::error::Result;
use crate::persist::PersistOptions;
use crate::registry::NamedRegistry;
use hoard_core::{CellValue, EventBus, ObservableCell, Subscription};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use std::fmt;
use std::hash::Hash;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_PROJECTION: AtomicU64 = AtomicU64::new(1);

/// Bound for item ids
pub trait ItemId: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

impl<K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static> ItemId for K {}

/// Change notifications of a [`ListProjection`]
#[derive(Clone, Debug, PartialEq)]
pub enum ListEvent<T> {
    ItemAdded(T),
    /// New items of one `add_items` call, in list order
    ItemsAdded(Vec<T>),
    ItemUpdated(T),
    /// Items changed by one `batch_update` call
    ItemsUpdated(Vec<T>),
    ItemRemoved(T),
    /// The whole list was replaced
    ListReplaced(Vec<T>),
}

type ItemCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;
type IdFn<T, K> = dyn Fn(&T) -> K + Send + Sync;

struct Waiter<T> {
    id: String,
    callback: ItemCallback<T>,
}

/// Per-id state: a live item cell, or subscribers waiting for the item
enum ItemSlot<T> {
    Bound(ObservableCell<T>),
    Pending(SmallVec<[Waiter<T>; 2]>),
}

struct ListInner<T, K> {
    key: String,
    registry: Arc<NamedRegistry>,
    list: ObservableCell<Vec<T>>,
    id_of: Box<IdFn<T, K>>,
    slots: Mutex<FxHashMap<K, ItemSlot<T>>>,
    added: EventBus<T>,
    events: EventBus<ListEvent<T>>,
    /// Subscriber id of the projection on the list cell
    tracker: String,
}

/// A registry list cell plus one cell per item
///
/// Cheap to clone; clones share the same projection.
pub struct ListProjection<T, K> {
    inner: Arc<ListInner<T, K>>,
}

impl<T, K> Clone for ListProjection<T, K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: CellValue + PartialEq, K: ItemId> ListProjection<T, K> {
    /// Project the registry list cell under `key`, creating it with
    /// `initial` if unseen
    ///
    /// `id_of` extracts the identifier of an item. `options` persists the
    /// whole list like any registry cell.
    pub fn new(
        registry: &Arc<NamedRegistry>,
        key: &str,
        initial: Vec<T>,
        id_of: impl Fn(&T) -> K + Send + Sync + 'static,
        options: Option<PersistOptions<Vec<T>>>,
    ) -> Result<Self> {
        let list = registry.get_or_create(key, initial, options)?;
        let reporter = registry.reporter().clone();
        let tracker = format!(
            "__projection:{}",
            NEXT_PROJECTION.fetch_add(1, Ordering::Relaxed)
        );

        let inner = Arc::new(ListInner {
            key: key.to_string(),
            registry: registry.clone(),
            list: list.clone(),
            id_of: Box::new(id_of),
            slots: Mutex::new(FxHashMap::default()),
            added: EventBus::with_reporter(format!("{key}:added"), reporter.clone()),
            events: EventBus::with_reporter(format!("{key}:events"), reporter),
            tracker: tracker.clone(),
        });

        // The replay builds the initial item cells.
        let weak: Weak<ListInner<T, K>> = Arc::downgrade(&inner);
        list.subscribe(tracker, move |items: &Vec<T>| {
            if let Some(inner) = weak.upgrade() {
                inner.sync(items);
            }
        });

        tracing::debug!(key, items = list.with(Vec::len), "list projection created");
        Ok(Self { inner })
    }

    /// Registry key of the list cell
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// The whole-list cell
    pub fn list_cell(&self) -> &ObservableCell<Vec<T>> {
        &self.inner.list
    }

    // =========================================================================
    // READS
    // =========================================================================

    /// Copy of the list
    pub fn get_items(&self) -> Vec<T> {
        self.inner.list.get()
    }

    /// Current value of the item with `id`
    ///
    /// Rebuilds the item cell from the list if it went missing.
    pub fn get_item(&self, id: &K) -> Option<T> {
        if let Some(ItemSlot::Bound(cell)) = self.inner.slots.lock().get(id) {
            return Some(cell.get());
        }
        self.inner.list.exclusive(|| -> Option<T> {
            let item = self.inner.find(id)?;
            let cell = self.inner.bind(id, item.clone());
            Some(cell.map_or(item, |cell| cell.get()))
        })
    }

    /// Whether an item with `id` is in the list
    pub fn contains(&self, id: &K) -> bool {
        self.inner.list.with(|items| items.iter().any(|item| (self.inner.id_of)(item) == *id))
    }

    /// Number of items
    pub fn len(&self) -> usize {
        self.inner.list.with(Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids in list order
    pub fn ids(&self) -> Vec<K> {
        self.inner.list.with(|items| items.iter().map(|item| (self.inner.id_of)(item)).collect())
    }

    // =========================================================================
    // MUTATIONS
    // =========================================================================

    /// Replace the whole list
    ///
    /// Every item cell is disposed and built again from `items`, so
    /// subscriptions made through [`ListProjection::subscribe_to_item`] on
    /// the old cells end here. Waiting subscribers whose id appears in
    /// `items` are activated.
    pub fn update_items(&self, items: Vec<T>) -> Result<()> {
        self.inner.list.exclusive(|| -> Result<()> {
            let retired = self.inner.retire_items();
            for cell in retired {
                cell.dispose();
            }
            self.inner.list.update(items.clone())?;
            self.inner.events.emit(&ListEvent::ListReplaced(items));
            Ok(())
        })
    }

    /// Apply `updater` to the item with `id`
    ///
    /// The item cell and the list both hold the result before either
    /// notifies. Returns `false` when `id` is not in the list.
    pub fn update_item(&self, id: &K, updater: impl FnOnce(&T) -> T) -> Result<bool> {
        self.inner.list.exclusive(|| -> Result<bool> {
            let mut items = self.inner.list.get();
            let Some(pos) = self.inner.position(&items, id) else {
                return Ok(false);
            };
            let current = self.inner.current(id, &items[pos]);
            let next = updater(&current);
            items[pos] = next.clone();

            let staged = self.inner.stage_item(id, &next)?;
            self.inner.commit(items, staged.into_iter())?;
            self.inner.events.emit(&ListEvent::ItemUpdated(next));
            Ok(true)
        })
    }

    /// Append `item`, or replace the item with the same id in place
    ///
    /// A new item gets its cell, activates waiting subscribers for its id,
    /// emits `ItemAdded` and runs the `on_item_added` callbacks. An existing
    /// id emits `ItemUpdated` instead.
    pub fn add_item(&self, item: T) -> Result<()> {
        self.inner.list.exclusive(|| -> Result<()> {
            let id = (self.inner.id_of)(&item);
            let mut items = self.inner.list.get();

            if let Some(pos) = self.inner.position(&items, &id) {
                items[pos] = item.clone();
                let staged = self.inner.stage_item(&id, &item)?;
                self.inner.commit(items, staged.into_iter())?;
                self.inner.events.emit(&ListEvent::ItemUpdated(item));
                return Ok(());
            }

            items.push(item.clone());
            self.inner.commit(items, std::iter::empty())?;
            self.inner.events.emit(&ListEvent::ItemAdded(item.clone()));
            self.inner.added.emit(&item);
            Ok(())
        })
    }

    /// Add several items with one list commit
    ///
    /// New ids are appended and reported in one `ItemsAdded` event (the
    /// added callbacks run once per new item); ids already present are
    /// updated in place and reported as `ItemUpdated`.
    pub fn add_items(&self, batch: Vec<T>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.inner.list.exclusive(|| -> Result<()> {
            let mut items = self.inner.list.get();
            let mut added = Vec::new();
            let mut updated = Vec::new();
            let mut staged = Vec::new();

            for item in batch {
                let id = (self.inner.id_of)(&item);
                match self.inner.position(&items, &id) {
                    Some(pos) => {
                        items[pos] = item.clone();
                        if let Some(cell) = self.inner.stage_item(&id, &item)? {
                            push_unique(&mut staged, cell);
                        }
                        updated.push(item);
                    }
                    None => {
                        items.push(item.clone());
                        added.push(item);
                    }
                }
            }

            self.inner.commit(items, staged.into_iter())?;

            for item in updated {
                self.inner.events.emit(&ListEvent::ItemUpdated(item));
            }
            if !added.is_empty() {
                tracing::trace!(key = %self.inner.key, count = added.len(), "items added");
                for item in &added {
                    self.inner.added.emit(item);
                }
                self.inner.events.emit(&ListEvent::ItemsAdded(added));
            }
            Ok(())
        })
    }

    /// Remove the item with `id`, disposing its cell
    ///
    /// Subscribers still waiting for `id` are dropped as well. Returns
    /// whether an item was removed.
    pub fn remove_item(&self, id: &K) -> Result<bool> {
        Ok(self.remove_items(std::slice::from_ref(id))? > 0)
    }

    /// Remove every listed id with one list commit, returning how many
    /// items were removed
    pub fn remove_items(&self, ids: &[K]) -> Result<usize> {
        self.inner.list.exclusive(|| -> Result<usize> {
            let targets: FxHashSet<&K> = ids.iter().collect();
            let mut items = self.inner.list.get();
            let mut removed = Vec::new();
            items.retain(|item| {
                let keep = !targets.contains(&(self.inner.id_of)(item));
                if !keep {
                    removed.push(item.clone());
                }
                keep
            });

            let cells: Vec<ObservableCell<T>> = {
                let mut slots = self.inner.slots.lock();
                ids.iter()
                    .filter_map(|id| match slots.remove(id) {
                        Some(ItemSlot::Bound(cell)) => Some(cell),
                        _ => None,
                    })
                    .collect()
            };
            for cell in cells {
                cell.dispose();
            }

            if removed.is_empty() {
                return Ok(0);
            }
            self.inner.commit(items, std::iter::empty())?;
            let count = removed.len();
            for item in removed {
                self.inner.events.emit(&ListEvent::ItemRemoved(item));
            }
            Ok(count)
        })
    }

    /// Apply several updaters with a single whole-list notification
    ///
    /// Unknown ids are skipped. Returns how many updates were applied.
    pub fn batch_update<F>(&self, updates: impl IntoIterator<Item = (K, F)>) -> Result<usize>
    where
        F: FnOnce(&T) -> T,
    {
        self.inner.list.exclusive(|| -> Result<usize> {
            let mut items = self.inner.list.get();
            let mut staged = Vec::new();
            let mut changed = Vec::new();

            for (id, updater) in updates {
                let Some(pos) = self.inner.position(&items, &id) else {
                    continue;
                };
                let current = self.inner.current(&id, &items[pos]);
                let next = updater(&current);
                items[pos] = next.clone();
                if let Some(cell) = self.inner.stage_item(&id, &next)? {
                    push_unique(&mut staged, cell);
                }
                changed.push(next);
            }

            if changed.is_empty() {
                return Ok(0);
            }
            self.inner.commit(items, staged.into_iter())?;
            let count = changed.len();
            self.inner.events.emit(&ListEvent::ItemsUpdated(changed));
            Ok(count)
        })
    }

    /// [`ListProjection::batch_update`] after yielding to the runtime once
    pub async fn batch_update_async<F>(
        &self,
        updates: impl IntoIterator<Item = (K, F)>,
    ) -> Result<usize>
    where
        F: FnOnce(&T) -> T,
    {
        tokio::task::yield_now().await;
        self.batch_update(updates)
    }

    /// [`ListProjection::add_items`] after yielding to the runtime once
    pub async fn add_items_async(&self, batch: Vec<T>) -> Result<()> {
        tokio::task::yield_now().await;
        self.add_items(batch)
    }

    // =========================================================================
    // SUBSCRIPTIONS
    // =========================================================================

    /// Subscribe to the whole list; replays the current list
    pub fn subscribe<F>(&self, id: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&Vec<T>) + Send + Sync + 'static,
    {
        self.inner.list.subscribe(id, callback)
    }

    /// Remove a whole-list subscriber
    pub fn unsubscribe(&self, id: &str) {
        self.inner.list.unsubscribe(id);
    }

    /// Subscribe to the item with `item_id`, whether or not it exists yet
    ///
    /// An existing item behaves like [`ObservableCell::subscribe`]. Otherwise
    /// the callback waits and is attached, with a replay, when the item is
    /// added. The returned handle removes the subscription in either state.
    pub fn subscribe_to_item<F>(
        &self,
        item_id: K,
        subscriber_id: impl Into<String>,
        callback: F,
    ) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let subscriber_id = subscriber_id.into();
        let callback: ItemCallback<T> = Arc::new(callback);

        self.inner.list.exclusive(|| {
            let bound = match self.inner.find(&item_id) {
                Some(item) => self.inner.bind(&item_id, item),
                None => None,
            };
            match bound {
                Some(cell) => {
                    let callback = callback.clone();
                    cell.subscribe(subscriber_id.clone(), move |value: &T| callback(value));
                }
                None => {
                    let mut slots = self.inner.slots.lock();
                    let slot = slots
                        .entry(item_id.clone())
                        .or_insert_with(|| ItemSlot::Pending(SmallVec::new()));
                    if let ItemSlot::Pending(waiters) = slot {
                        waiters.retain(|waiter| waiter.id != subscriber_id);
                        waiters.push(Waiter {
                            id: subscriber_id.clone(),
                            callback,
                        });
                    }
                    tracing::trace!(key = %self.inner.key, item = ?item_id, "item subscription pending");
                }
            }
        });

        let weak = Arc::downgrade(&self.inner);
        let handle_id = subscriber_id.clone();
        Subscription::new(subscriber_id, move || {
            if let Some(inner) = weak.upgrade() {
                inner.remove_item_subscriber(&item_id, &handle_id);
            }
        })
    }

    /// Number of subscribers waiting for `item_id` to appear
    pub fn pending_count(&self, item_id: &K) -> usize {
        match self.inner.slots.lock().get(item_id) {
            Some(ItemSlot::Pending(waiters)) => waiters.len(),
            _ => 0,
        }
    }

    /// Subscribers of the item cell for `item_id`, 0 when unbound
    pub fn item_subscriber_count(&self, item_id: &K) -> usize {
        match self.inner.slots.lock().get(item_id) {
            Some(ItemSlot::Bound(cell)) => cell.subscriber_count(),
            _ => 0,
        }
    }

    /// Call `callback` with every newly added item
    pub fn on_item_added<F>(&self, id: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.inner.added.subscribe(id, callback)
    }

    /// Remove an `on_item_added` callback
    pub fn remove_item_added(&self, id: &str) {
        self.inner.added.unsubscribe(id);
    }

    /// Listen for [`ListEvent`]s; no replay
    pub fn subscribe_events<F>(&self, id: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&ListEvent<T>) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(id, callback)
    }

    pub fn unsubscribe_events(&self, id: &str) {
        self.inner.events.unsubscribe(id);
    }

    // =========================================================================
    // VIEWS
    // =========================================================================

    pub fn filter(&self, predicate: impl Fn(&T) -> bool) -> Vec<T> {
        self.get_items().into_iter().filter(|item| predicate(item)).collect()
    }

    pub fn find(&self, predicate: impl Fn(&T) -> bool) -> Option<T> {
        self.get_items().into_iter().find(|item| predicate(item))
    }

    pub fn any(&self, predicate: impl Fn(&T) -> bool) -> bool {
        self.get_items().iter().any(predicate)
    }

    pub fn all(&self, predicate: impl Fn(&T) -> bool) -> bool {
        self.get_items().iter().all(predicate)
    }

    pub fn fold<A>(&self, init: A, f: impl FnMut(A, &T) -> A) -> A {
        self.get_items().iter().fold(init, f)
    }

    pub fn map<U>(&self, f: impl FnMut(&T) -> U) -> Vec<U> {
        self.get_items().iter().map(f).collect()
    }

    /// Sorted copy; the list itself keeps insertion order
    pub fn sorted_by(&self, compare: impl FnMut(&T, &T) -> std::cmp::Ordering) -> Vec<T> {
        let mut items = self.get_items();
        items.sort_by(compare);
        items
    }

    /// Copy of `range`, clamped to the list bounds
    pub fn slice(&self, range: Range<usize>) -> Vec<T> {
        let items = self.get_items();
        let end = range.end.min(items.len());
        let start = range.start.min(end);
        items[start..end].to_vec()
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Dispose every item cell, drop waiting subscribers and callbacks, and
    /// remove the list cell from the registry
    pub fn dispose(&self) {
        let cells: Vec<ObservableCell<T>> = self
            .inner
            .slots
            .lock()
            .drain()
            .filter_map(|(_, slot)| match slot {
                ItemSlot::Bound(cell) => Some(cell),
                ItemSlot::Pending(_) => None,
            })
            .collect();
        for cell in &cells {
            cell.dispose();
        }
        self.inner.added.clear();
        self.inner.events.clear();
        self.inner.list.unsubscribe(&self.inner.tracker);
        self.inner.registry.remove(&self.inner.key);
        tracing::debug!(key = %self.inner.key, items = cells.len(), "list projection disposed");
    }
}

impl ListProjection<serde_json::Value, String> {
    /// Projection over JSON objects identified by the `id_field` attribute
    ///
    /// String ids are used as is; other values by their JSON text, so
    /// `{"id": 1}` has id `"1"`. Items without the field share the id `""`.
    pub fn by_field(
        registry: &Arc<NamedRegistry>,
        key: &str,
        initial: Vec<serde_json::Value>,
        id_field: &str,
        options: Option<PersistOptions<Vec<serde_json::Value>>>,
    ) -> Result<Self> {
        let field = id_field.to_string();
        Self::new(
            registry,
            key,
            initial,
            move |item: &serde_json::Value| match item.get(&field) {
                Some(serde_json::Value::String(id)) => id.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            },
            options,
        )
    }
}

impl<T: CellValue + PartialEq + fmt::Debug, K: ItemId> fmt::Debug for ListProjection<T, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListProjection")
            .field("key", &self.inner.key)
            .field("items", &self.inner.list.get())
            .field("slots", &self.inner.slots.lock().len())
            .finish()
    }
}

fn push_unique<T: CellValue>(cells: &mut Vec<ObservableCell<T>>, cell: ObservableCell<T>) {
    if !cells.iter().any(|staged| staged.ptr_eq(&cell)) {
        cells.push(cell);
    }
}

impl<T: CellValue + PartialEq, K: ItemId> ListInner<T, K> {
    fn position(&self, items: &[T], id: &K) -> Option<usize> {
        items.iter().position(|item| (self.id_of)(item) == *id)
    }

    fn find(&self, id: &K) -> Option<T> {
        self.list
            .with(|items| items.iter().find(|item| (self.id_of)(item) == *id).cloned())
    }

    /// Item cell value if bound, else the list's copy
    fn current(&self, id: &K, fallback: &T) -> T {
        match self.slots.lock().get(id) {
            Some(ItemSlot::Bound(cell)) => cell.get(),
            _ => fallback.clone(),
        }
    }

    fn item_cell(&self, id: &K, value: T) -> ObservableCell<T> {
        ObservableCell::with_reporter(
            format!("{}[{:?}]", self.key, id),
            value,
            self.registry.reporter().clone(),
        )
    }

    /// Unbind every item cell, leaving waiting subscribers in place
    fn retire_items(&self) -> Vec<ObservableCell<T>> {
        let mut retired = Vec::new();
        self.slots.lock().retain(|_, slot| match slot {
            ItemSlot::Bound(cell) => {
                retired.push(cell.clone());
                false
            }
            ItemSlot::Pending(_) => true,
        });
        retired
    }

    /// Bound cell for `id`, creating it from `value` and attaching any
    /// waiting subscribers if needed
    fn bind(&self, id: &K, value: T) -> Option<ObservableCell<T>> {
        let (cell, waiters) = {
            let mut slots = self.slots.lock();
            if let Some(ItemSlot::Bound(cell)) = slots.get(id) {
                return Some(cell.clone());
            }
            let cell = self.item_cell(id, value);
            let waiters = match slots.insert(id.clone(), ItemSlot::Bound(cell.clone())) {
                Some(ItemSlot::Pending(waiters)) => waiters,
                _ => SmallVec::new(),
            };
            (cell, waiters)
        };
        activate(&cell, waiters);
        Some(cell)
    }

    /// Stage `value` into the bound cell for `id` without notifying
    fn stage_item(&self, id: &K, value: &T) -> Result<Option<ObservableCell<T>>> {
        let cell = match self.slots.lock().get(id) {
            Some(ItemSlot::Bound(cell)) => cell.clone(),
            _ => return Ok(None),
        };
        cell.stage(value.clone())?;
        Ok(Some(cell))
    }

    /// Stage the list, then publish the staged item cells and the list
    ///
    /// The list publish runs `sync`, which creates cells for new ids.
    fn commit(
        &self,
        items: Vec<T>,
        staged: impl Iterator<Item = ObservableCell<T>>,
    ) -> Result<()> {
        self.list.stage(items)?;
        for cell in staged {
            cell.publish();
        }
        self.list.publish();
        Ok(())
    }

    /// Bring the item cells in line with `items`
    ///
    /// Runs on every list notification. After a local mutation it finds
    /// nothing left to do; after an outside write it creates, updates and
    /// disposes item cells as needed.
    fn sync(&self, items: &[T]) {
        let mut changed = Vec::new();
        let mut activations = Vec::new();
        let mut dropped = Vec::new();
        {
            let mut slots = self.slots.lock();
            let mut present = FxHashSet::default();
            for item in items {
                let id = (self.id_of)(item);
                match slots.get(&id) {
                    Some(ItemSlot::Bound(cell)) => {
                        if cell.with(|value| value != item) && cell.stage(item.clone()).is_ok() {
                            push_unique(&mut changed, cell.clone());
                        }
                    }
                    _ => {
                        let cell = self.item_cell(&id, item.clone());
                        if let Some(ItemSlot::Pending(waiters)) =
                            slots.insert(id.clone(), ItemSlot::Bound(cell.clone()))
                        {
                            activations.push((cell, waiters));
                        }
                    }
                }
                present.insert(id);
            }
            slots.retain(|id, slot| match slot {
                ItemSlot::Bound(cell) if !present.contains(id) => {
                    dropped.push(cell.clone());
                    false
                }
                _ => true,
            });
        }

        for cell in changed {
            cell.publish();
        }
        for (cell, waiters) in activations {
            activate(&cell, waiters);
        }
        for cell in dropped {
            cell.dispose();
        }
    }

    fn remove_item_subscriber(&self, id: &K, subscriber_id: &str) {
        let mut slots = self.slots.lock();
        let cell = match slots.get_mut(id) {
            Some(ItemSlot::Bound(cell)) => cell.clone(),
            Some(ItemSlot::Pending(waiters)) => {
                waiters.retain(|waiter| waiter.id != subscriber_id);
                let empty = waiters.is_empty();
                if empty {
                    slots.remove(id);
                }
                return;
            }
            None => return,
        };
        drop(slots);
        cell.unsubscribe(subscriber_id);
    }
}

fn activate<T: CellValue>(cell: &ObservableCell<T>, waiters: SmallVec<[Waiter<T>; 2]>) {
    for waiter in waiters {
        let callback = waiter.callback;
        cell.subscribe(waiter.id, move |value: &T| callback(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Row {
        id: u32,
        name: String,
    }

    fn row(id: u32, name: &str) -> Row {
        Row {
            id,
            name: name.to_string(),
        }
    }

    fn projection(initial: Vec<Row>) -> ListProjection<Row, u32> {
        ListProjection::new(&NamedRegistry::new(), "rows", initial, |r: &Row| r.id, None).unwrap()
    }

    fn record<T: Clone + Send + 'static>(log: &Arc<Mutex<Vec<T>>>) -> impl Fn(&T) + Send + Sync {
        let log = log.clone();
        move |v: &T| log.lock().push(v.clone())
    }

    #[test]
    fn test_initial_items_get_cells() {
        let rows = projection(vec![row(1, "a"), row(2, "b")]);
        assert_eq!(rows.get_item(&2), Some(row(2, "b")));
        assert_eq!(rows.ids(), vec![1, 2]);
        assert_eq!(rows.get_item(&3), None);
    }

    #[test]
    fn test_pending_subscription_fulfilled_on_add() {
        let rows = projection(Vec::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let _sub = rows.subscribe_to_item(42, "s1", record(&seen));
        assert!(seen.lock().is_empty());
        assert_eq!(rows.pending_count(&42), 1);

        rows.add_item(row(42, "answer")).unwrap();
        assert_eq!(*seen.lock(), vec![row(42, "answer")]);
        assert_eq!(rows.pending_count(&42), 0);
        assert_eq!(rows.item_subscriber_count(&42), 1);

        rows.update_item(&42, |r| row(r.id, "still")).unwrap();
        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn test_subscription_handle_works_in_both_states() {
        let rows = projection(Vec::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let waiting = rows.subscribe_to_item(7, "w", record(&seen));
        waiting.unsubscribe();
        assert_eq!(rows.pending_count(&7), 0);
        rows.add_item(row(7, "x")).unwrap();
        assert!(seen.lock().is_empty());

        let converted = rows.subscribe_to_item(8, "c", record(&seen));
        rows.add_item(row(8, "y")).unwrap();
        converted.unsubscribe();
        converted.unsubscribe();
        rows.update_item(&8, |r| row(r.id, "z")).unwrap();
        assert_eq!(*seen.lock(), vec![row(8, "y")]);
    }

    #[test]
    fn test_item_and_list_consistent_before_notify() {
        let rows = projection(vec![row(7, "seven")]);
        let list = rows.list_cell().clone();
        let observed = Arc::new(Mutex::new(Vec::new()));

        let observed_clone = observed.clone();
        rows.subscribe_to_item(7, "check", move |item: &Row| {
            let in_list = list.get().into_iter().find(|r| r.id == 7);
            observed_clone.lock().push(in_list.as_ref() == Some(item));
        });

        rows.update_item(&7, |r| row(r.id, "SEVEN")).unwrap();
        assert_eq!(*observed.lock(), vec![true, true]);
        assert_eq!(
            rows.get_item(&7),
            rows.get_items().into_iter().find(|r| r.id == 7)
        );
    }

    #[test]
    fn test_update_unknown_id_is_noop() {
        let rows = projection(vec![row(1, "a")]);
        let version = rows.list_cell().version();
        assert!(!rows.update_item(&9, |r| r.clone()).unwrap());
        assert_eq!(rows.list_cell().version(), version);
    }

    #[test]
    fn test_add_existing_id_updates_in_place() {
        let rows = projection(vec![row(1, "a"), row(2, "b")]);
        let events = Arc::new(Mutex::new(Vec::new()));
        rows.subscribe_events("log", record(&events));

        rows.add_item(row(1, "z")).unwrap();
        assert_eq!(rows.get_items(), vec![row(1, "z"), row(2, "b")]);
        assert_eq!(*events.lock(), vec![ListEvent::ItemUpdated(row(1, "z"))]);
    }

    #[test]
    fn test_remove_item_disposes_cell_and_drops_waiters() {
        let rows = projection(vec![row(1, "a")]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        rows.subscribe_to_item(1, "s", record(&seen));
        rows.subscribe_to_item(5, "later", record(&seen));

        assert!(rows.remove_item(&1).unwrap());
        assert!(!rows.remove_item(&5).unwrap());
        assert_eq!(rows.pending_count(&5), 0);
        assert_eq!(rows.get_item(&1), None);
        assert!(rows.is_empty());

        rows.add_item(row(5, "e")).unwrap();
        assert_eq!(*seen.lock(), vec![row(1, "a")]);
    }

    #[test]
    fn test_batch_update_notifies_list_once() {
        let rows = projection((1..=10).map(|id| row(id, "x")).collect());
        let notifications = Arc::new(Mutex::new(0));
        let notifications_clone = notifications.clone();
        rows.subscribe("count", move |_: &Vec<Row>| *notifications_clone.lock() += 1);

        let applied = rows
            .batch_update((1..=10).map(|id| (id, move |r: &Row| row(r.id, &format!("v{id}")))))
            .unwrap();

        assert_eq!(applied, 10);
        assert_eq!(*notifications.lock(), 2);
        assert_eq!(rows.get_item(&4), Some(row(4, "v4")));
        assert!(rows.all(|r| r.name.starts_with('v')));
    }

    #[test]
    fn test_add_items_splits_new_and_existing() {
        let rows = projection(vec![row(1, "a")]);
        let events = Arc::new(Mutex::new(Vec::new()));
        let added = Arc::new(Mutex::new(Vec::new()));
        let notifications = Arc::new(Mutex::new(0));
        rows.subscribe_events("log", record(&events));
        rows.on_item_added("added", record(&added));
        let notifications_clone = notifications.clone();
        rows.subscribe("count", move |_: &Vec<Row>| *notifications_clone.lock() += 1);

        rows.add_items(vec![row(2, "b"), row(1, "A"), row(3, "c")]).unwrap();

        assert_eq!(rows.get_items(), vec![row(1, "A"), row(2, "b"), row(3, "c")]);
        assert_eq!(*notifications.lock(), 2);
        assert_eq!(*added.lock(), vec![row(2, "b"), row(3, "c")]);
        assert_eq!(
            *events.lock(),
            vec![
                ListEvent::ItemUpdated(row(1, "A")),
                ListEvent::ItemsAdded(vec![row(2, "b"), row(3, "c")]),
            ]
        );

        rows.remove_item_added("added");
        rows.add_item(row(4, "d")).unwrap();
        assert_eq!(added.lock().len(), 2);
    }

    #[test]
    fn test_update_items_rebuilds_cells() {
        let rows = projection(vec![row(1, "a"), row(2, "b")]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        rows.subscribe_to_item(1, "one", record(&seen));
        rows.subscribe_to_item(3, "three", record(&seen));

        rows.update_items(vec![row(1, "a2"), row(3, "c")]).unwrap();

        assert_eq!(rows.get_item(&1), Some(row(1, "a2")));
        assert_eq!(rows.get_item(&2), None);
        assert_eq!(rows.get_item(&3), Some(row(3, "c")));
        assert_eq!(rows.item_subscriber_count(&1), 0);
        assert_eq!(rows.item_subscriber_count(&3), 1);
        assert_eq!(*seen.lock(), vec![row(1, "a"), row(3, "c")]);
    }

    #[test]
    fn test_outside_write_to_list_cell_syncs_items() {
        let rows = projection(vec![row(1, "a")]);
        rows.list_cell().update(vec![row(1, "b"), row(2, "c")]).unwrap();

        assert_eq!(rows.get_item(&1), Some(row(1, "b")));
        assert_eq!(rows.get_item(&2), Some(row(2, "c")));
    }

    #[test]
    fn test_remove_item_drops_duplicate_ids() {
        let rows = projection(Vec::new());
        rows.list_cell().update(vec![row(1, "a"), row(1, "b"), row(2, "c")]).unwrap();

        assert!(rows.remove_item(&1).unwrap());
        assert_eq!(rows.get_items(), vec![row(2, "c")]);
    }

    #[test]
    fn test_get_item_heals_missing_cell() {
        let rows = projection(vec![row(1, "a")]);
        rows.inner.slots.lock().clear();

        assert_eq!(rows.get_item(&1), Some(row(1, "a")));
        assert!(matches!(
            rows.inner.slots.lock().get(&1),
            Some(ItemSlot::Bound(_))
        ));
    }

    #[test]
    fn test_views_do_not_mutate() {
        let rows = projection(vec![row(3, "c"), row(1, "a"), row(2, "b")]);

        assert_eq!(rows.filter(|r| r.id > 1).len(), 2);
        assert_eq!(rows.find(|r| r.name == "a"), Some(row(1, "a")));
        assert!(rows.any(|r| r.id == 2));
        assert_eq!(rows.fold(0, |sum, r| sum + r.id), 6);
        assert_eq!(rows.map(|r| r.id), vec![3, 1, 2]);
        assert_eq!(
            rows.sorted_by(|a, b| a.id.cmp(&b.id)).iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(rows.slice(1..10), vec![row(1, "a"), row(2, "b")]);
        assert_eq!(rows.ids(), vec![3, 1, 2]);
    }

    #[test]
    fn test_json_items_by_field() {
        use serde_json::json;

        let registry = NamedRegistry::new();
        let list = ListProjection::by_field(
            &registry,
            "json",
            vec![json!({"id": 1, "name": "a"})],
            "id",
            None,
        )
        .unwrap();

        list.add_item(json!({"id": 1, "name": "b"})).unwrap();
        assert_eq!(list.get_items(), vec![json!({"id": 1, "name": "b"})]);
        assert_eq!(list.get_item(&"1".to_string()), Some(json!({"id": 1, "name": "b"})));
    }

    #[test]
    fn test_dispose_removes_list_from_registry() {
        let registry = NamedRegistry::new();
        let rows =
            ListProjection::new(&registry, "rows", vec![row(1, "a")], |r: &Row| r.id, None).unwrap();
        let item_seen = Arc::new(Mutex::new(Vec::new()));
        rows.subscribe_to_item(1, "s", record(&item_seen));

        rows.dispose();
        assert!(!registry.has("rows"));
        assert!(rows.list_cell().is_disposed());
        assert!(rows.add_item(row(2, "b")).is_err());
    }
}
