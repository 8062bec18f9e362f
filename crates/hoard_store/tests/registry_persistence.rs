//! Registry cells connected to storage backends

use hoard_store::{
    CellEvent, Connector, ConnectionPool, Database, EventKind, FnCodec, HydrateState,
    KeyValueStore, MemoryConnector, MemoryStore, NamedRegistry, PersistOptions, StorageError,
    StoreConfig, StoreError,
};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

fn record<T: Clone + Send + 'static>(log: &Arc<Mutex<Vec<T>>>) -> impl Fn(&T) + Send + Sync {
    let log = log.clone();
    move |v: &T| log.lock().push(v.clone())
}

fn record_kinds<T>(log: &Arc<Mutex<Vec<EventKind>>>) -> impl Fn(&CellEvent<T>) + Send + Sync {
    let log = log.clone();
    move |event: &CellEvent<T>| log.lock().push(event.kind)
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

/// Blocks pooled reads until opened
#[derive(Clone, Default)]
struct Gate {
    state: Arc<(Mutex<bool>, Condvar)>,
}

impl Gate {
    fn open(&self) {
        let (open, signal) = &*self.state;
        *open.lock() = true;
        signal.notify_all();
    }

    fn wait(&self) {
        let (open, signal) = &*self.state;
        let mut open = open.lock();
        while !*open {
            signal.wait(&mut open);
        }
    }
}

struct GatedConnector {
    gate: Gate,
    inner: MemoryConnector,
}

impl Connector for GatedConnector {
    fn open(&self, db_name: &str) -> Result<Arc<dyn Database>, StorageError> {
        Ok(Arc::new(GatedDatabase {
            gate: self.gate.clone(),
            inner: self.inner.open(db_name)?,
        }))
    }
}

struct GatedDatabase {
    gate: Gate,
    inner: Arc<dyn Database>,
}

impl Database for GatedDatabase {
    fn get(&self, store: &str, key: &str) -> Result<Option<String>, StorageError> {
        self.gate.wait();
        self.inner.get(store, key)
    }

    fn put(&self, store: &str, key: &str, value: &str) -> Result<(), StorageError> {
        self.inner.put(store, key, value)
    }

    fn delete(&self, store: &str, key: &str) -> Result<(), StorageError> {
        self.inner.delete(store, key)
    }

    fn keys(&self, store: &str) -> Result<Vec<String>, StorageError> {
        self.inner.keys(store)
    }
}

// =============================================================================
// DEBOUNCED WRITES
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_debounce_coalesces_to_last_value() {
    let store = Arc::new(MemoryStore::new());
    let registry = NamedRegistry::builder().shared_local_store(store.clone()).build();
    let cell = registry
        .get_or_create("counter", 0, Some(PersistOptions::json()))
        .unwrap();
    assert_eq!(registry.hydrated("counter").await, Some(HydrateState::Empty));

    for i in 1..=10 {
        cell.update(i).unwrap();
    }

    tokio::time::sleep(Duration::from_millis(299)).await;
    assert_eq!(store.write_count(), 0);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(store.write_count(), 1);
    assert_eq!(store.get("hoard:counter").unwrap().as_deref(), Some("10"));
}

#[tokio::test(start_paused = true)]
async fn test_new_update_restarts_the_window() {
    let store = Arc::new(MemoryStore::new());
    let registry = NamedRegistry::builder().shared_local_store(store.clone()).build();
    let cell = registry
        .get_or_create("name", String::new(), Some(PersistOptions::json()))
        .unwrap();
    registry.hydrated("name").await;

    cell.update("a".to_string()).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    cell.update("ab".to_string()).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(store.write_count(), 0);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(store.write_count(), 1);
    assert_eq!(store.get("hoard:name").unwrap().as_deref(), Some("\"ab\""));
}

#[tokio::test(start_paused = true)]
async fn test_flush_writes_immediately() {
    let store = Arc::new(MemoryStore::new());
    let registry = NamedRegistry::builder().shared_local_store(store.clone()).build();
    let cell = registry
        .get_or_create(
            "flag",
            false,
            Some(PersistOptions::json().debounce(Duration::from_secs(60))),
        )
        .unwrap();
    registry.hydrated("flag").await;

    assert!(!registry.flush("flag").await.unwrap());
    cell.update(true).unwrap();
    assert!(registry.flush("flag").await.unwrap());
    assert_eq!(store.get("hoard:flag").unwrap().as_deref(), Some("true"));
    assert!(!registry.flush("flag").await.unwrap());

    assert!(matches!(
        registry.flush("missing").await,
        Err(StoreError::NotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_persisted_follows_value_updated() {
    let registry = NamedRegistry::builder()
        .local_store(MemoryStore::new())
        .config(StoreConfig::default().with_emit_events(true))
        .build();
    let cell = registry
        .get_or_create("ev", 0, Some(PersistOptions::json()))
        .unwrap();
    let kinds = Arc::new(Mutex::new(Vec::new()));
    cell.subscribe_events("log", record_kinds(&kinds));

    registry.hydrated("ev").await;
    cell.update(1).unwrap();
    assert_eq!(
        *kinds.lock(),
        vec![EventKind::InitialLoadComplete, EventKind::ValueUpdated]
    );

    registry.flush("ev").await.unwrap();
    assert_eq!(
        *kinds.lock(),
        vec![
            EventKind::InitialLoadComplete,
            EventKind::ValueUpdated,
            EventKind::Persisted
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_write_failure_keeps_in_memory_value() {
    let store = Arc::new(MemoryStore::new());
    let registry = NamedRegistry::builder().shared_local_store(store.clone()).build();
    let cell = registry
        .get_or_create("fragile", 0, Some(PersistOptions::json().emit_events(true)))
        .unwrap();
    let kinds = Arc::new(Mutex::new(Vec::new()));
    cell.subscribe_events("log", record_kinds(&kinds));
    registry.hydrated("fragile").await;

    store.set_read_only(true);
    cell.update(5).unwrap();
    let err = registry.flush("fragile").await.unwrap_err();
    assert!(matches!(err, StoreError::Storage { op: "write", .. }));
    assert_eq!(cell.get(), 5);
    assert_eq!(kinds.lock().last(), Some(&EventKind::Error));

    // Not retried: the failed value is gone from the buffer
    store.set_read_only(false);
    assert!(!registry.flush("fragile").await.unwrap());

    cell.update(6).unwrap();
    assert!(registry.flush("fragile").await.unwrap());
    assert_eq!(store.get("hoard:fragile").unwrap().as_deref(), Some("6"));
}

#[tokio::test(start_paused = true)]
async fn test_custom_codec_and_storage_key() {
    let store = Arc::new(MemoryStore::new().with_record("theme-v2", "DARK"));
    let registry = NamedRegistry::builder().shared_local_store(store.clone()).build();
    let codec = FnCodec::new(
        |value: &String| Ok(value.to_uppercase()),
        |text: &str| Ok(text.to_lowercase()),
    );
    let theme = registry
        .get_or_create(
            "theme",
            "light".to_string(),
            Some(PersistOptions::with_codec(codec).storage_key("theme-v2")),
        )
        .unwrap();

    assert_eq!(registry.hydrated("theme").await, Some(HydrateState::Loaded));
    assert_eq!(theme.get(), "dark");

    theme.update("solarized".to_string()).unwrap();
    registry.flush("theme").await.unwrap();
    assert_eq!(store.get("theme-v2").unwrap().as_deref(), Some("SOLARIZED"));
}

// =============================================================================
// HYDRATE
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_hydrate_overwrites_initial_value_once() {
    let store = Arc::new(MemoryStore::new().with_record("hoard:count", "5"));
    let registry = NamedRegistry::builder()
        .shared_local_store(store.clone())
        .config(StoreConfig::default().with_emit_events(true))
        .build();

    let cell = registry
        .get_or_create("count", 0, Some(PersistOptions::json()))
        .unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let kinds = Arc::new(Mutex::new(Vec::new()));
    cell.subscribe("ui", record(&seen));
    cell.subscribe_events("log", record_kinds(&kinds));
    assert_eq!(cell.get(), 0);
    assert_eq!(registry.persistence_state("count"), Some(HydrateState::Pending));

    assert_eq!(registry.hydrated("count").await, Some(HydrateState::Loaded));
    assert_eq!(cell.get(), 5);
    assert_eq!(*seen.lock(), vec![0, 5]);
    assert_eq!(
        *kinds.lock(),
        vec![EventKind::LoadedFromStorage, EventKind::InitialLoadComplete]
    );

    // The loaded value is not written back
    assert!(!registry.flush("count").await.unwrap());
    assert_eq!(store.write_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stored_value_wins_over_write_before_hydrate() {
    let store = Arc::new(MemoryStore::new().with_record("hoard:count", "5"));
    let registry = NamedRegistry::builder().shared_local_store(store.clone()).build();

    let cell = registry
        .get_or_create("count", 0, Some(PersistOptions::json()))
        .unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    cell.subscribe("ui", record(&seen));
    cell.update(7).unwrap();

    assert_eq!(registry.hydrated("count").await, Some(HydrateState::Loaded));
    assert_eq!(cell.get(), 5);
    assert_eq!(*seen.lock(), vec![0, 7, 5]);

    // The buffered 7 must not reach storage after the stored value won
    registry.flush("count").await.unwrap();
    assert_eq!(store.get("hoard:count").unwrap().as_deref(), Some("5"));
}

#[tokio::test(start_paused = true)]
async fn test_unreadable_record_keeps_initial_value() {
    let store = MemoryStore::new().with_record("hoard:list", "{not json");
    let registry = NamedRegistry::builder()
        .local_store(store)
        .config(StoreConfig::default().with_emit_events(true))
        .build();
    let cell = registry
        .get_or_create("list", vec![1, 2], Some(PersistOptions::json()))
        .unwrap();
    let kinds = Arc::new(Mutex::new(Vec::new()));
    cell.subscribe_events("log", record_kinds(&kinds));

    let state = registry.hydrated("list").await.unwrap();
    assert!(matches!(state, HydrateState::Failed(_)));
    assert_eq!(cell.get(), vec![1, 2]);
    assert_eq!(*kinds.lock(), vec![EventKind::InitialLoadComplete]);
}

#[tokio::test]
async fn test_stuck_hydrate_stays_pending() {
    let gate = Gate::default();
    let connector = MemoryConnector::new();
    connector.insert("hoard", "state", "hoard:slow", "5");
    let pool = ConnectionPool::new(GatedConnector {
        gate: gate.clone(),
        inner: connector,
    });
    let registry = NamedRegistry::builder().pool(pool).build();

    let cell = registry
        .get_or_create("slow", 0, Some(PersistOptions::json().pooled_default()))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(registry.persistence_state("slow"), Some(HydrateState::Pending));
    assert_eq!(cell.get(), 0);

    gate.open();
    assert_eq!(registry.hydrated("slow").await, Some(HydrateState::Loaded));
    assert_eq!(cell.get(), 5);
}

#[tokio::test]
async fn test_hydrate_timeout_falls_back_to_initial_value() {
    let gate = Gate::default();
    let connector = MemoryConnector::new();
    connector.insert("hoard", "state", "hoard:slow", "5");
    let pool = ConnectionPool::new(GatedConnector {
        gate: gate.clone(),
        inner: connector.clone(),
    });
    let registry = NamedRegistry::builder()
        .pool(pool)
        .config(
            StoreConfig::default()
                .with_hydrate_timeout_ms(100)
                .with_emit_events(true),
        )
        .build();

    let cell = registry
        .get_or_create("slow", 0, Some(PersistOptions::json().pooled_default()))
        .unwrap();
    let kinds = Arc::new(Mutex::new(Vec::new()));
    cell.subscribe_events("log", record_kinds(&kinds));

    assert_eq!(registry.hydrated("slow").await, Some(HydrateState::TimedOut));
    assert_eq!(cell.get(), 0);
    assert_eq!(*kinds.lock(), vec![EventKind::InitialLoadComplete]);

    // Writes still work while the read is stuck
    cell.update(3).unwrap();
    assert!(registry.flush("slow").await.unwrap());
    assert_eq!(
        connector.record("hoard", "state", "hoard:slow").as_deref(),
        Some("3")
    );

    gate.open();
    registry.shutdown().await.unwrap();
}

// =============================================================================
// BACKENDS AND LIFECYCLE
// =============================================================================

#[tokio::test]
async fn test_pool_shares_one_connection_per_database() {
    let connector = MemoryConnector::new();
    let pool = ConnectionPool::new(connector.clone());
    let registry = NamedRegistry::builder().pool(pool.clone()).build();

    let a = registry
        .get_or_create("a", 1, Some(PersistOptions::json().pooled("app", "state")))
        .unwrap();
    let b = registry
        .get_or_create("b", 2, Some(PersistOptions::json().pooled("app", "prefs")))
        .unwrap();
    assert_eq!(pool.open_count(), 1);
    assert_eq!(pool.ref_count("app"), 2);

    registry.hydrated("a").await;
    registry.hydrated("b").await;
    a.update(10).unwrap();
    b.update(20).unwrap();
    assert_eq!(registry.flush_all().await.unwrap(), 2);
    assert_eq!(connector.record("app", "state", "hoard:a").as_deref(), Some("10"));
    assert_eq!(connector.record("app", "prefs", "hoard:b").as_deref(), Some("20"));

    // Removing one cell releases its reference, not the shared connection
    assert!(registry.remove("a"));
    eventually(|| pool.ref_count("app") == 1).await;
    assert_eq!(pool.connection_count(), 1);

    b.update(21).unwrap();
    assert!(registry.flush("b").await.unwrap());
    assert_eq!(connector.record("app", "prefs", "hoard:b").as_deref(), Some("21"));
    assert_eq!(pool.open_count(), 1);

    // Shutdown gives back the last reference without closing the pool
    registry.shutdown().await.unwrap();
    assert!(!pool.is_closed());
    assert_eq!(pool.connection_count(), 0);
}

#[tokio::test]
async fn test_shutdown_leaves_shared_pool_to_other_registries() {
    let connector = MemoryConnector::new();
    let pool = ConnectionPool::new(connector.clone());
    let first = NamedRegistry::builder().pool(pool.clone()).build();
    let second = NamedRegistry::builder().pool(pool.clone()).build();

    first
        .get_or_create("a", 1, Some(PersistOptions::json().pooled_default()))
        .unwrap();
    let b = second
        .get_or_create("b", 2, Some(PersistOptions::json().pooled_default()))
        .unwrap();
    first.hydrated("a").await;
    second.hydrated("b").await;
    assert_eq!(pool.ref_count("hoard"), 2);

    first.shutdown().await.unwrap();
    assert!(!pool.is_closed());
    assert_eq!(pool.ref_count("hoard"), 1);

    b.update(22).unwrap();
    assert!(second.flush("b").await.unwrap());
    assert_eq!(connector.record("hoard", "state", "hoard:b").as_deref(), Some("22"));

    second.shutdown().await.unwrap();
    assert_eq!(pool.connection_count(), 0);
    assert_eq!(pool.open_count(), 1);
}

#[tokio::test]
async fn test_remove_still_writes_pending_value() {
    let connector = MemoryConnector::new();
    let pool = ConnectionPool::new(connector.clone());
    let registry = NamedRegistry::builder().pool(pool.clone()).build();

    let cell = registry
        .get_or_create(
            "draft",
            String::new(),
            Some(
                PersistOptions::json()
                    .pooled_default()
                    .debounce(Duration::from_secs(60)),
            ),
        )
        .unwrap();
    registry.hydrated("draft").await;
    cell.update("unsaved".to_string()).unwrap();

    registry.remove("draft");
    eventually(|| pool.connection_count() == 0).await;
    assert_eq!(
        connector.record("hoard", "state", "hoard:draft").as_deref(),
        Some("\"unsaved\"")
    );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_flushes_pending_values() {
    let store = Arc::new(MemoryStore::new());
    let registry = NamedRegistry::builder().shared_local_store(store.clone()).build();
    let cell = registry
        .get_or_create("todo", vec!["a".to_string()], Some(PersistOptions::json()))
        .unwrap();
    registry.hydrated("todo").await;

    cell.update(vec!["a".to_string(), "b".to_string()]).unwrap();
    registry.shutdown().await.unwrap();

    assert_eq!(store.get("hoard:todo").unwrap().as_deref(), Some("[\"a\",\"b\"]"));
    assert!(registry.is_empty());
    assert!(cell.is_disposed());
}

#[tokio::test]
async fn test_missing_backend_reports_error_event() {
    let registry = NamedRegistry::builder().build();
    let cell = registry
        .get_or_create("orphan", 1, Some(PersistOptions::json().pooled_default()))
        .unwrap();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let errors_clone = errors.clone();
    cell.subscribe_events("log", move |event: &CellEvent<i32>| {
        if event.kind == EventKind::Error {
            errors_clone.lock().push(event.error.clone().unwrap_or_default());
        }
    });

    eventually(|| !errors.lock().is_empty()).await;
    assert!(errors.lock()[0].contains("no connection pool"));
    assert!(matches!(
        registry.persistence_state("orphan"),
        Some(HydrateState::Unavailable(_))
    ));

    cell.update(2).unwrap();
    assert_eq!(cell.get(), 2);
    assert!(!registry.flush("orphan").await.unwrap());
}

#[tokio::test]
async fn test_existing_key_ignores_new_options() {
    let store = Arc::new(MemoryStore::new().with_record("hoard:k", "5"));
    let registry = NamedRegistry::builder().shared_local_store(store).build();

    let plain = registry.get_or_create("k", 1, None).unwrap();
    let again = registry
        .get_or_create("k", 999, Some(PersistOptions::json()))
        .unwrap();

    assert!(plain.ptr_eq(&again));
    assert_eq!(again.get(), 1);
    assert_eq!(registry.hydrated("k").await, None);
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_on_disk_backends_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig::default().with_data_dir(dir.path());

    {
        let registry = NamedRegistry::builder()
            .config(config.clone())
            .with_default_backends()
            .unwrap()
            .build();
        let local = registry
            .get_or_create("theme", "light".to_string(), Some(PersistOptions::json()))
            .unwrap();
        let pooled = registry
            .get_or_create(
                "todos",
                Vec::<String>::new(),
                Some(PersistOptions::json().pooled("app", "lists")),
            )
            .unwrap();
        registry.hydrated("theme").await;
        registry.hydrated("todos").await;

        local.update("dark".to_string()).unwrap();
        pooled.update(vec!["ship".to_string()]).unwrap();
        registry.shutdown().await.unwrap();
    }

    assert!(dir.path().join("local.json").exists());
    assert!(dir.path().join("app.sqlite3").exists());

    let registry = NamedRegistry::builder()
        .config(config)
        .with_default_backends()
        .unwrap()
        .build();
    let local = registry
        .get_or_create("theme", "light".to_string(), Some(PersistOptions::json()))
        .unwrap();
    let pooled = registry
        .get_or_create(
            "todos",
            Vec::<String>::new(),
            Some(PersistOptions::json().pooled("app", "lists")),
        )
        .unwrap();

    assert_eq!(registry.hydrated("theme").await, Some(HydrateState::Loaded));
    assert_eq!(registry.hydrated("todos").await, Some(HydrateState::Loaded));
    assert_eq!(local.get(), "dark");
    assert_eq!(pooled.get(), vec!["ship".to_string()]);
    registry.shutdown().await.unwrap();
}
