//! Connection-pooled asynchronous storage
//!
//! Records are addressed by `(database, store, key)`. The [`ConnectionPool`]
//! keeps at most one open connection per database name and shares it between
//! every cell that uses that database. Connections are reference counted:
//! [`ConnectionPool::acquire`] takes a reference, [`PooledConnection::release`]
//! (or dropping the handle) gives it back, and the connection is closed when
//! the last reference goes, so a registry shutting down only closes what no
//! one else holds. [`ConnectionPool::close_all`] is the forced variant for
//! the pool's owner.
//!
//! Backends implement the blocking [`Database`] trait; [`PooledConnection`]
//! runs every call on tokio's blocking pool.

use crate::error::StorageError;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// One open database
pub trait Database: Send + Sync {
    fn get(&self, store: &str, key: &str) -> Result<Option<String>, StorageError>;
    fn put(&self, store: &str, key: &str, value: &str) -> Result<(), StorageError>;
    fn delete(&self, store: &str, key: &str) -> Result<(), StorageError>;
    fn keys(&self, store: &str) -> Result<Vec<String>, StorageError>;
}

/// Opens databases by name
pub trait Connector: Send + Sync {
    fn open(&self, db_name: &str) -> Result<Arc<dyn Database>, StorageError>;
}

/// Database and store names end up in file and table names
pub fn validate_name(name: &str) -> Result<(), StorageError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidName(name.to_string()))
    }
}

struct PoolEntry {
    db: Arc<dyn Database>,
    refs: usize,
}

#[derive(Default)]
struct PoolState {
    connections: FxHashMap<String, PoolEntry>,
    closed: bool,
}

/// Reference-counted connections, one per database name
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    state: Mutex<PoolState>,
    opened: AtomicUsize,
}

impl ConnectionPool {
    pub fn new(connector: impl Connector + 'static) -> Arc<Self> {
        Self::from_connector(Arc::new(connector))
    }

    pub fn from_connector(connector: Arc<dyn Connector>) -> Arc<Self> {
        Arc::new(Self {
            connector,
            state: Mutex::new(PoolState::default()),
            opened: AtomicUsize::new(0),
        })
    }

    /// Take a reference to the connection for `db_name`, opening it if needed
    ///
    /// The connector runs without the pool lock held; if two callers open
    /// the same database at once, the first connection stored wins.
    pub fn acquire(self: &Arc<Self>, db_name: &str) -> Result<PooledConnection, StorageError> {
        validate_name(db_name)?;
        if let Some(db) = self.share(db_name)? {
            return Ok(self.handle(db_name, db));
        }

        let opened = self.connector.open(db_name)?;
        let mut state = self.state.lock();
        if state.closed {
            return Err(StorageError::PoolClosed);
        }
        let db = match state.connections.get_mut(db_name) {
            Some(entry) => {
                entry.refs += 1;
                entry.db.clone()
            }
            None => {
                self.opened.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(db = db_name, "opened pooled connection");
                state.connections.insert(
                    db_name.to_string(),
                    PoolEntry {
                        db: opened.clone(),
                        refs: 1,
                    },
                );
                opened
            }
        };
        drop(state);
        Ok(self.handle(db_name, db))
    }

    /// Existing connection for `db_name` with one more reference
    fn share(&self, db_name: &str) -> Result<Option<Arc<dyn Database>>, StorageError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(StorageError::PoolClosed);
        }
        Ok(state.connections.get_mut(db_name).map(|entry| {
            entry.refs += 1;
            entry.db.clone()
        }))
    }

    fn handle(self: &Arc<Self>, db_name: &str, db: Arc<dyn Database>) -> PooledConnection {
        PooledConnection {
            pool: self.clone(),
            db_name: db_name.to_string(),
            db,
            released: AtomicBool::new(false),
        }
    }

    /// Give back one reference; the last one closes the connection
    pub fn release(&self, db_name: &str) {
        let mut state = self.state.lock();
        let remaining = match state.connections.get_mut(db_name) {
            Some(entry) => {
                entry.refs = entry.refs.saturating_sub(1);
                entry.refs
            }
            None => return,
        };
        if remaining == 0 {
            state.connections.remove(db_name);
            tracing::debug!(db = db_name, "closed pooled connection");
        }
    }

    /// Force-close every connection, referenced or not, and refuse further
    /// use
    ///
    /// Live handles fail with [`StorageError::PoolClosed`] afterwards. Meant
    /// for the pool's owner at process exit; registries sharing the pool only
    /// release their own references.
    pub fn close_all(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        let count = state.connections.len();
        state.connections.clear();
        tracing::debug!(connections = count, "connection pool closed");
    }

    /// Whether [`ConnectionPool::close_all`] has run
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Connections currently open
    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Connections opened over the pool's lifetime
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Live references to the connection for `db_name`
    pub fn ref_count(&self, db_name: &str) -> usize {
        self.state
            .lock()
            .connections
            .get(db_name)
            .map_or(0, |entry| entry.refs)
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConnectionPool")
            .field("connections", &state.connections.len())
            .field("closed", &state.closed)
            .field("opened", &self.opened.load(Ordering::SeqCst))
            .finish()
    }
}

/// One reference to a pooled connection
///
/// Released explicitly or on drop, whichever comes first.
pub struct PooledConnection {
    pool: Arc<ConnectionPool>,
    db_name: String,
    db: Arc<dyn Database>,
    released: AtomicBool,
}

impl PooledConnection {
    /// Database this handle points at
    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    pub async fn get(&self, store: &str, key: &str) -> Result<Option<String>, StorageError> {
        let (store, key) = (store.to_string(), key.to_string());
        self.run(move |db| db.get(&store, &key)).await
    }

    pub async fn put(&self, store: &str, key: &str, value: String) -> Result<(), StorageError> {
        let (store, key) = (store.to_string(), key.to_string());
        self.run(move |db| db.put(&store, &key, &value)).await
    }

    pub async fn delete(&self, store: &str, key: &str) -> Result<(), StorageError> {
        let (store, key) = (store.to_string(), key.to_string());
        self.run(move |db| db.delete(&store, &key)).await
    }

    pub async fn keys(&self, store: &str) -> Result<Vec<String>, StorageError> {
        let store = store.to_string();
        self.run(move |db| db.keys(&store)).await
    }

    async fn run<R, F>(&self, op: F) -> Result<R, StorageError>
    where
        R: Send + 'static,
        F: FnOnce(&dyn Database) -> Result<R, StorageError> + Send + 'static,
    {
        if self.released.load(Ordering::SeqCst) || self.pool.is_closed() {
            return Err(StorageError::PoolClosed);
        }
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || op(db.as_ref()))
            .await
            .map_err(|err| StorageError::Join(err.to_string()))?
    }

    /// Give the reference back to the pool; later calls are no-ops
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.pool.release(&self.db_name);
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("db_name", &self.db_name)
            .field("released", &self.released.load(Ordering::SeqCst))
            .finish()
    }
}

// =============================================================================
// IN-MEMORY BACKEND
// =============================================================================

type RecordKey = (String, String, String);

/// Connector whose databases live in process
///
/// Records outlive individual connections, so closing and reopening a
/// database keeps its data.
#[derive(Default, Clone)]
pub struct MemoryConnector {
    records: Arc<Mutex<BTreeMap<RecordKey, String>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record directly
    pub fn insert(&self, db: &str, store: &str, key: &str, value: &str) {
        self.records.lock().insert(
            (db.to_string(), store.to_string(), key.to_string()),
            value.to_string(),
        );
    }

    pub fn record(&self, db: &str, store: &str, key: &str) -> Option<String> {
        self.records
            .lock()
            .get(&(db.to_string(), store.to_string(), key.to_string()))
            .cloned()
    }
}

impl Connector for MemoryConnector {
    fn open(&self, db_name: &str) -> Result<Arc<dyn Database>, StorageError> {
        Ok(Arc::new(MemoryDatabase {
            db_name: db_name.to_string(),
            records: self.records.clone(),
        }))
    }
}

struct MemoryDatabase {
    db_name: String,
    records: Arc<Mutex<BTreeMap<RecordKey, String>>>,
}

impl MemoryDatabase {
    fn address(&self, store: &str, key: &str) -> RecordKey {
        (self.db_name.clone(), store.to_string(), key.to_string())
    }
}

impl Database for MemoryDatabase {
    fn get(&self, store: &str, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.records.lock().get(&self.address(store, key)).cloned())
    }

    fn put(&self, store: &str, key: &str, value: &str) -> Result<(), StorageError> {
        self.records
            .lock()
            .insert(self.address(store, key), value.to_string());
        Ok(())
    }

    fn delete(&self, store: &str, key: &str) -> Result<(), StorageError> {
        self.records.lock().remove(&self.address(store, key));
        Ok(())
    }

    fn keys(&self, store: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .records
            .lock()
            .keys()
            .filter(|(db, s, _)| *db == self.db_name && s == store)
            .map(|(_, _, key)| key.clone())
            .collect())
    }
}
