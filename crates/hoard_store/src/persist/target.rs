//! Where one cell's record lives

use super::kv::KeyValueStore;
use super::pool::PooledConnection;
use crate::error::StorageError;
use std::fmt;
use std::sync::Arc;

/// A fully addressed storage record for one cell
#[derive(Clone)]
pub enum StorageTarget {
    Local {
        store: Arc<dyn KeyValueStore>,
        key: String,
    },
    Pooled {
        connection: Arc<PooledConnection>,
        store_name: String,
        key: String,
    },
}

impl StorageTarget {
    /// Storage key of the record
    pub fn key(&self) -> &str {
        match self {
            StorageTarget::Local { key, .. } | StorageTarget::Pooled { key, .. } => key,
        }
    }

    /// Read the stored text, `None` when nothing is stored
    pub async fn read(&self) -> Result<Option<String>, StorageError> {
        match self {
            StorageTarget::Local { store, key } => {
                let (store, key) = (store.clone(), key.clone());
                blocking(move || store.get(&key)).await
            }
            StorageTarget::Pooled {
                connection,
                store_name,
                key,
            } => connection.get(store_name, key).await,
        }
    }

    /// Replace the stored text
    pub async fn write(&self, text: String) -> Result<(), StorageError> {
        match self {
            StorageTarget::Local { store, key } => {
                let (store, key) = (store.clone(), key.clone());
                blocking(move || store.set(&key, &text)).await
            }
            StorageTarget::Pooled {
                connection,
                store_name,
                key,
            } => connection.put(store_name, key, text).await,
        }
    }
}

/// Local stores may touch the filesystem, so they run off the worker threads
async fn blocking<R, F>(op: F) -> Result<R, StorageError>
where
    R: Send + 'static,
    F: FnOnce() -> Result<R, StorageError> + Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|err| StorageError::Join(err.to_string()))?
}

impl fmt::Display for StorageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageTarget::Local { key, .. } => write!(f, "local:{key}"),
            StorageTarget::Pooled {
                connection,
                store_name,
                key,
            } => write!(f, "{}/{}:{}", connection.db_name(), store_name, key),
        }
    }
}

impl fmt::Debug for StorageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorageTarget({self})")
    }
}
