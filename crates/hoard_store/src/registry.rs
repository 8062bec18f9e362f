//! Keyed cell registry
//!
//! [`NamedRegistry`] maps string keys to exactly one [`ObservableCell`] each.
//! The first caller to name a key creates the cell with its initial value and
//! persistence options; every later caller gets the same cell back and its
//! own initial value and options are ignored.
//!
//! The registry is an ordinary value: build one at startup, share it as an
//! `Arc<NamedRegistry>`, and build a fresh one per test.
//!
//! # Example
//!
//! ```rust
//! use hoard_store::{MemoryStore, NamedRegistry};
//!
//! let registry = NamedRegistry::builder().local_store(MemoryStore::new()).build();
//!
//! let first = registry.get_or_create("counter", 1, None).unwrap();
//! let second = registry.get_or_create("counter", 999, None).unwrap();
//!
//! assert!(first.ptr_eq(&second));
//! assert_eq!(second.get(), 1);
//! ```

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::persist::{
    self, Backends, ConnectionPool, FileStore, HydrateState, KeyValueStore, MemoryConnector,
    MemoryStore, PersistHandle, PersistOptions,
};
use hoard_core::{
    default_reporter, CellEvent, CellValue, EventKind, ObservableCell, SharedReporter,
};
use indexmap::IndexMap;
use parking_lot::Mutex;
use rustc_hash::FxBuildHasher;
use std::any::{type_name, Any};
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;

/// Type-erased view of a registered cell
trait AnyCell: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn value_type(&self) -> &'static str;
    fn dispose(&self);
}

impl<T: CellValue> AnyCell for ObservableCell<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn value_type(&self) -> &'static str {
        type_name::<T>()
    }

    fn dispose(&self) {
        ObservableCell::dispose(self);
    }
}

struct Entry {
    cell: Box<dyn AnyCell>,
    persistence: Option<Arc<PersistHandle>>,
}

impl Entry {
    fn typed<T: CellValue>(&self, key: &str) -> Result<ObservableCell<T>> {
        self.cell
            .as_any()
            .downcast_ref::<ObservableCell<T>>()
            .cloned()
            .ok_or_else(|| StoreError::TypeMismatch {
                key: key.to_string(),
                expected: type_name::<T>(),
                found: self.cell.value_type(),
            })
    }

    /// Dispose the cell; its writer still writes the pending value on the
    /// way out
    fn retire(&self) {
        self.cell.dispose();
        if let Some(handle) = &self.persistence {
            handle.abort_hydrate();
        }
    }
}

type EntryMap = IndexMap<String, Entry, FxBuildHasher>;

/// One cell per key, created on first use
pub struct NamedRegistry {
    config: StoreConfig,
    local_store: Option<Arc<dyn KeyValueStore>>,
    pool: Option<Arc<ConnectionPool>>,
    runtime: Option<Handle>,
    reporter: SharedReporter,
    entries: Mutex<EntryMap>,
}

impl NamedRegistry {
    /// Start configuring a registry
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Registry without storage backends; persisted cells run memory-only
    pub fn new() -> Arc<Self> {
        Self::builder().build()
    }

    /// Registry backed by a [`MemoryStore`] and a [`MemoryConnector`] pool
    pub fn in_memory() -> Arc<Self> {
        Self::builder()
            .local_store(MemoryStore::new())
            .pool(ConnectionPool::new(MemoryConnector::new()))
            .build()
    }

    /// Defaults applied to persisted cells
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Backend for [`BackendKind::Local`](crate::BackendKind::Local) cells
    pub fn local_store(&self) -> Option<&Arc<dyn KeyValueStore>> {
        self.local_store.as_ref()
    }

    /// Backend for pooled cells
    pub fn pool(&self) -> Option<&Arc<ConnectionPool>> {
        self.pool.as_ref()
    }

    /// Reporter shared by every cell the registry creates
    pub fn reporter(&self) -> &SharedReporter {
        &self.reporter
    }

    // =========================================================================
    // LOOKUP
    // =========================================================================

    /// Return the cell for `key`, creating it with `initial` if unseen
    ///
    /// For a new key with enabled `options` the cell is connected to storage
    /// and its stored value, if any, replaces `initial` asynchronously. For an
    /// existing key both `initial` and `options` are ignored.
    pub fn get_or_create<T: CellValue>(
        &self,
        key: &str,
        initial: T,
        options: Option<PersistOptions<T>>,
    ) -> Result<ObservableCell<T>> {
        if let Some(entry) = self.entries.lock().get(key) {
            if options.is_some() {
                tracing::debug!(key, "cell exists, persistence options ignored");
            }
            return entry.typed(key);
        }

        // Opening a backend can block, so it happens outside the lock
        let cell = ObservableCell::with_reporter(key, initial, self.reporter.clone());
        let persistence = options
            .filter(PersistOptions::is_enabled)
            .map(|options| Arc::new(self.attach(&cell, &options)));
        let persisted = persistence.is_some();
        let created = Entry {
            cell: Box::new(cell.clone()),
            persistence,
        };

        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(key) {
            let existing = entry.typed(key);
            drop(entries);
            created.retire();
            tracing::debug!(key, "cell created concurrently, keeping the first");
            return existing;
        }
        entries.insert(key.to_string(), created);
        drop(entries);

        tracing::debug!(key, persisted, "cell created");
        Ok(cell)
    }

    /// Like [`NamedRegistry::get_or_create`], computing the initial value
    /// only when the key is unseen
    ///
    /// `factory` runs without the registry lock held, so it may use the
    /// registry. If it registers `key` itself, that cell wins.
    pub fn get_or_create_with<T: CellValue>(
        &self,
        key: &str,
        factory: impl FnOnce() -> T,
        options: Option<PersistOptions<T>>,
    ) -> Result<ObservableCell<T>> {
        if let Some(entry) = self.entries.lock().get(key) {
            return entry.typed(key);
        }
        let initial = factory();
        self.get_or_create(key, initial, options)
    }

    /// The existing cell for `key`
    pub fn get<T: CellValue>(&self, key: &str) -> Result<ObservableCell<T>> {
        match self.entries.lock().get(key) {
            Some(entry) => entry.typed(key),
            None => Err(StoreError::NotFound(key.to_string())),
        }
    }

    /// Whether `key` is registered
    pub fn has(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Registered keys in creation order
    pub fn keys(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    /// Number of registered cells
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no cell is registered
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    // =========================================================================
    // REMOVAL
    // =========================================================================

    /// Drop the entry for `key` and dispose its cell
    ///
    /// A pending debounced write is still performed. Returns whether the key
    /// was registered.
    pub fn remove(&self, key: &str) -> bool {
        let entry = self.entries.lock().shift_remove(key);
        match entry {
            Some(entry) => {
                entry.retire();
                tracing::debug!(key, "cell removed");
                true
            }
            None => false,
        }
    }

    /// Drop and dispose every entry
    pub fn clear(&self) {
        let entries = std::mem::take(&mut *self.entries.lock());
        let count = entries.len();
        for entry in entries.values() {
            entry.retire();
        }
        tracing::debug!(count, "registry cleared");
    }

    // =========================================================================
    // PERSISTENCE
    // =========================================================================

    fn persistence(&self, key: &str) -> Result<Option<Arc<PersistHandle>>> {
        match self.entries.lock().get(key) {
            Some(entry) => Ok(entry.persistence.clone()),
            None => Err(StoreError::NotFound(key.to_string())),
        }
    }

    /// Write the pending value for `key` now
    ///
    /// Resolves to whether a value was written; `false` for cells without
    /// persistence.
    pub async fn flush(&self, key: &str) -> Result<bool> {
        match self.persistence(key)? {
            Some(handle) => handle.flush().await,
            None => Ok(false),
        }
    }

    /// Flush every persisted cell, returning how many values were written
    ///
    /// Every cell is attempted; the first failure is returned.
    pub async fn flush_all(&self) -> Result<usize> {
        let handles = self.persistence_handles();
        let mut written = 0;
        let mut first_error = None;
        for handle in handles {
            match handle.flush().await {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(key = handle.key(), error = %err, "flush failed");
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(written),
        }
    }

    /// Wait for the initial load of `key`
    ///
    /// `None` when the key is unknown or not persisted.
    pub async fn hydrated(&self, key: &str) -> Option<HydrateState> {
        let handle = self.persistence(key).ok().flatten()?;
        Some(handle.hydrated().await)
    }

    /// Current initial-load state of `key`, `None` when not persisted
    pub fn persistence_state(&self, key: &str) -> Option<HydrateState> {
        self.persistence(key)
            .ok()
            .flatten()
            .map(|handle| handle.hydrate_state())
    }

    /// Flush and stop every writer, dispose every cell, and release the
    /// registry's pooled connections
    ///
    /// A pool shared with other registries stays open for them; use
    /// [`ConnectionPool::close_all`] to force it shut. The registry is empty
    /// afterwards. Returns the first flush failure.
    pub async fn shutdown(&self) -> Result<()> {
        let entries = std::mem::take(&mut *self.entries.lock());
        let mut first_error = None;

        for (key, entry) in entries {
            if let Some(handle) = &entry.persistence {
                if let Err(err) = handle.flush().await {
                    tracing::warn!(key = %key, error = %err, "flush on shutdown failed");
                    first_error.get_or_insert(err);
                }
            }
            entry.cell.dispose();
            if let Some(handle) = &entry.persistence {
                handle.stop().await;
            }
        }

        tracing::debug!("registry shut down");
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn persistence_handles(&self) -> Vec<Arc<PersistHandle>> {
        self.entries
            .lock()
            .values()
            .filter_map(|entry| entry.persistence.clone())
            .collect()
    }

    /// Connect a new cell to storage, falling back to memory-only on
    /// configuration errors
    fn attach<T: CellValue>(
        &self,
        cell: &ObservableCell<T>,
        options: &PersistOptions<T>,
    ) -> PersistHandle {
        let resolved = options.resolve(cell.key(), &self.config);
        let backends = Backends {
            local: self.local_store.as_ref(),
            pool: self.pool.as_ref(),
            runtime: self.runtime.as_ref(),
        };

        match persist::attach(cell, options, resolved, backends) {
            Ok(handle) => handle,
            Err(err) => {
                tracing::error!(key = cell.key(), error = %err, "persistence unavailable, cell is memory-only");
                self.report_unavailable(cell, &err);
                PersistHandle::unavailable(cell.key(), err.to_string())
            }
        }
    }

    /// Emit the configuration error once listeners have had a chance to
    /// subscribe
    fn report_unavailable<T: CellValue>(&self, cell: &ObservableCell<T>, err: &StoreError) {
        let event = CellEvent::new(EventKind::Error, cell.key()).with_error(err);
        match &self.runtime {
            Some(runtime) => {
                let cell = cell.downgrade();
                runtime.spawn(async move {
                    tokio::task::yield_now().await;
                    if let Some(cell) = cell.upgrade() {
                        cell.emit_event(event);
                    }
                });
            }
            None => cell.emit_event(event),
        }
    }
}

impl fmt::Debug for NamedRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedRegistry")
            .field("keys", &self.keys())
            .field("local_store", &self.local_store.is_some())
            .field("pool", &self.pool)
            .field("runtime", &self.runtime.is_some())
            .finish()
    }
}

/// Builder for [`NamedRegistry`]
#[derive(Default)]
pub struct RegistryBuilder {
    config: StoreConfig,
    local_store: Option<Arc<dyn KeyValueStore>>,
    pool: Option<Arc<ConnectionPool>>,
    runtime: Option<Handle>,
    reporter: Option<SharedReporter>,
}

impl RegistryBuilder {
    /// Defaults for persisted cells
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Synchronous key-value backend owned by the registry
    pub fn local_store(self, store: impl KeyValueStore + 'static) -> Self {
        self.shared_local_store(Arc::new(store))
    }

    /// Key-value backend shared with the caller
    pub fn shared_local_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.local_store = Some(store);
        self
    }

    /// Connection pool, possibly shared with other registries
    pub fn pool(mut self, pool: Arc<ConnectionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Runtime for hydrate and writer tasks; defaults to the current one
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Where subscriber failures of registry cells are reported
    pub fn reporter(mut self, reporter: SharedReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// On-disk backends under the configured `data_dir`: a [`FileStore`]
    /// and, with the `sqlite` feature, a SQLite pool
    pub fn with_default_backends(mut self) -> Result<Self> {
        let dir = self.config.data_dir.clone().ok_or_else(|| StoreError::Config {
            key: String::new(),
            message: "data_dir is not set".to_string(),
        })?;
        self.local_store = Some(Arc::new(FileStore::in_dir(&dir)));
        #[cfg(feature = "sqlite")]
        {
            self.pool = Some(ConnectionPool::new(persist::SqliteConnector::new(&dir)));
        }
        Ok(self)
    }

    /// Finish the registry; without a runtime, persistence is unavailable
    pub fn build(self) -> Arc<NamedRegistry> {
        let runtime = self.runtime.or_else(|| Handle::try_current().ok());
        if runtime.is_none() {
            tracing::debug!("no tokio runtime, persistence disabled");
        }
        Arc::new(NamedRegistry {
            config: self.config,
            local_store: self.local_store,
            pool: self.pool,
            runtime,
            reporter: self.reporter.unwrap_or_else(default_reporter),
            entries: Mutex::new(EntryMap::default()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hoard_core::CellError;

    #[test]
    fn test_single_instance_first_value_wins() {
        let registry = NamedRegistry::new();
        let a = registry.get_or_create("k", 1, None).unwrap();
        let b = registry.get_or_create("k", 999, None).unwrap();

        assert!(a.ptr_eq(&b));
        assert_eq!(b.get(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_type_mismatch_and_not_found() {
        let registry = NamedRegistry::new();
        registry.get_or_create("n", 1u32, None).unwrap();

        let err = registry.get::<String>("n").unwrap_err();
        assert!(matches!(
            err,
            StoreError::TypeMismatch { ref key, found, .. } if key == "n" && found == "u32"
        ));
        assert!(matches!(
            registry.get::<u32>("missing"),
            Err(StoreError::NotFound(key)) if key == "missing"
        ));
        assert_eq!(registry.get::<u32>("n").unwrap().get(), 1);
    }

    #[test]
    fn test_factory_only_runs_for_new_keys() {
        let registry = NamedRegistry::new();
        let calls = Arc::new(Mutex::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            registry
                .get_or_create_with(
                    "lazy",
                    move || {
                        *calls.lock() += 1;
                        vec![1, 2, 3]
                    },
                    None,
                )
                .unwrap();
        }
        assert_eq!(*calls.lock(), 1);
    }

    #[test]
    fn test_reentrant_factory_keeps_first_cell() {
        let registry = NamedRegistry::new();
        let inner = registry.clone();
        let cell = registry
            .get_or_create_with(
                "k",
                move || {
                    inner.get_or_create("k", 7, None).unwrap();
                    8
                },
                None,
            )
            .unwrap();

        assert_eq!(cell.get(), 7);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_and_clear_dispose() {
        let registry = NamedRegistry::new();
        let a = registry.get_or_create("a", 1, None).unwrap();
        let b = registry.get_or_create("b", 2, None).unwrap();
        a.subscribe("s", |_: &i32| {});
        assert_eq!(registry.keys(), vec!["a", "b"]);

        assert!(registry.remove("a"));
        assert!(!registry.remove("a"));
        assert!(a.is_disposed());
        assert_eq!(a.subscriber_count(), 0);
        assert!(matches!(a.update(3), Err(CellError::Disposed(_))));

        registry.clear();
        assert!(b.is_disposed());
        assert!(registry.is_empty());

        let fresh = registry.get_or_create("a", 10, None).unwrap();
        assert!(!fresh.ptr_eq(&a));
        assert_eq!(fresh.get(), 10);
    }

    #[test]
    fn test_missing_runtime_is_memory_only() {
        let registry = NamedRegistry::builder().local_store(MemoryStore::new()).build();
        let cell = registry
            .get_or_create("p", 1, Some(PersistOptions::json()))
            .unwrap();

        cell.update(2).unwrap();
        assert_eq!(cell.get(), 2);
        assert!(!cell.has_write_hook());
        assert!(matches!(
            registry.persistence_state("p"),
            Some(HydrateState::Unavailable(_))
        ));
    }

    #[test]
    fn test_disabled_options_skip_persistence() {
        let registry = NamedRegistry::new();
        registry
            .get_or_create("off", 1, Some(PersistOptions::json().enabled(false)))
            .unwrap();
        assert_eq!(registry.persistence_state("off"), None);
    }
}
