//! Persistence for registry cells
//!
//! A persisted cell gets two background tasks on the registry's runtime:
//!
//! - a **hydrate** task that reads the stored record once and, if there is
//!   one, replaces the cell's initial value through the normal fan-out path;
//! - a **writer** task fed by the cell's write hook that coalesces updates
//!   and writes the latest value once per debounce window.
//!
//! Both are reached through the [`PersistHandle`] the registry keeps next to
//! the cell. Nothing here can fail a `get` or `update` on the cell: storage
//! problems are logged and surfaced as `Error` events.

mod codec;
mod hydrate;
mod kv;
mod options;
mod pool;
#[cfg(feature = "sqlite")]
mod sqlite;
mod target;
mod writer;

pub use codec::{Codec, FnCodec, JsonCodec, SharedCodec};
pub use hydrate::HydrateState;
pub use kv::{FileStore, KeyValueStore, MemoryStore};
pub use options::{BackendKind, PersistOptions, ResolvedOptions, TargetSpec};
pub use pool::{validate_name, ConnectionPool, Connector, Database, MemoryConnector, PooledConnection};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteConnector;
pub use target::StorageTarget;

use crate::error::{Result, StoreError};
use hoard_core::{CellValue, ObservableCell};
use hydrate::HydrateTask;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use writer::{Control, WriterTask};

/// Backends and runtime a registry offers to the cells it creates
#[derive(Clone, Copy)]
pub(crate) struct Backends<'a> {
    pub(crate) local: Option<&'a Arc<dyn KeyValueStore>>,
    pub(crate) pool: Option<&'a Arc<ConnectionPool>>,
    pub(crate) runtime: Option<&'a Handle>,
}

/// Connect `cell` to storage: install the write hook and spawn the writer
/// and hydrate tasks
///
/// Errors are configuration errors; the cell is left untouched.
pub(crate) fn attach<T: CellValue>(
    cell: &ObservableCell<T>,
    options: &PersistOptions<T>,
    resolved: ResolvedOptions,
    backends: Backends<'_>,
) -> Result<PersistHandle> {
    let key = cell.key().to_string();
    let runtime = backends
        .runtime
        .ok_or_else(|| StoreError::NoRuntime(key.clone()))?;
    let target = resolve_target(&key, &resolved, backends)?;

    cell.set_emit_events(resolved.emit_events);

    let (values_tx, values_rx) = mpsc::unbounded_channel::<T>();
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(HydrateState::Pending);

    let writer = WriterTask {
        key: key.clone(),
        target: target.clone(),
        codec: options.codec().clone(),
        debounce: resolved.debounce,
        cell: cell.downgrade(),
    };
    let hydrate = HydrateTask {
        key: key.clone(),
        target: target.clone(),
        codec: options.codec().clone(),
        cell: cell.downgrade(),
        created_version: cell.version(),
        timeout: resolved.hydrate_timeout,
        state: state_tx,
    };

    cell.set_write_hook(Arc::new(move |value: &T| {
        let _ = values_tx.send(value.clone());
    }));
    let writer = runtime.spawn(writer.run(values_rx, control_rx));
    let hydrate = runtime.spawn(hydrate.run());

    tracing::debug!(
        key = %key,
        target = %target,
        debounce_ms = resolved.debounce.as_millis() as u64,
        "persistence attached"
    );

    Ok(PersistHandle {
        key,
        target: Some(target),
        control: Some(control_tx),
        writer: Mutex::new(Some(writer)),
        hydrate_task: Mutex::new(Some(hydrate)),
        hydrate: state_rx,
    })
}

fn resolve_target(
    key: &str,
    resolved: &ResolvedOptions,
    backends: Backends<'_>,
) -> Result<StorageTarget> {
    match &resolved.target {
        TargetSpec::Local => {
            let store = backends.local.ok_or_else(|| StoreError::Config {
                key: key.to_string(),
                message: "no local key-value store configured".to_string(),
            })?;
            Ok(StorageTarget::Local {
                store: store.clone(),
                key: resolved.storage_key.clone(),
            })
        }
        TargetSpec::Pooled {
            db_name,
            store_name,
        } => {
            let pool = backends.pool.ok_or_else(|| StoreError::Config {
                key: key.to_string(),
                message: "no connection pool configured".to_string(),
            })?;
            pool::validate_name(store_name)
                .map_err(|source| StoreError::storage(key, "open", source))?;
            let connection = pool
                .acquire(db_name)
                .map_err(|source| StoreError::storage(key, "open", source))?;
            Ok(StorageTarget::Pooled {
                connection: Arc::new(connection),
                store_name: store_name.clone(),
                key: resolved.storage_key.clone(),
            })
        }
    }
}

/// The registry's side of one persisted cell
pub struct PersistHandle {
    key: String,
    target: Option<StorageTarget>,
    control: Option<mpsc::UnboundedSender<Control>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    hydrate_task: Mutex<Option<JoinHandle<()>>>,
    hydrate: watch::Receiver<HydrateState>,
}

impl PersistHandle {
    /// Handle for a cell whose persistence could not be set up
    pub(crate) fn unavailable(key: impl Into<String>, reason: impl Into<String>) -> Self {
        let (_, hydrate) = watch::channel(HydrateState::Unavailable(reason.into()));
        Self {
            key: key.into(),
            target: None,
            control: None,
            writer: Mutex::new(None),
            hydrate_task: Mutex::new(None),
            hydrate,
        }
    }

    /// Registry key of the cell
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Storage record, `None` when persistence is unavailable
    pub fn target(&self) -> Option<&StorageTarget> {
        self.target.as_ref()
    }

    /// Whether the cell is connected to storage
    pub fn is_available(&self) -> bool {
        self.control.is_some()
    }

    /// Write the buffered value now instead of at the end of the window
    ///
    /// Resolves to whether a value was written. Fails with
    /// [`StoreError::Closed`] once the writer has stopped.
    pub async fn flush(&self) -> Result<bool> {
        let Some(control) = &self.control else {
            return Ok(false);
        };
        let (reply, response) = oneshot::channel();
        control
            .send(Control::Flush(reply))
            .map_err(|_| StoreError::Closed(self.key.clone()))?;
        response
            .await
            .map_err(|_| StoreError::Closed(self.key.clone()))?
    }

    /// Initial-load state right now
    pub fn hydrate_state(&self) -> HydrateState {
        let state = self.hydrate.borrow();
        state.clone()
    }

    /// Wait until the initial load reaches a final state
    pub async fn hydrated(&self) -> HydrateState {
        let mut hydrate = self.hydrate.clone();
        if let Ok(state) = hydrate.wait_for(HydrateState::is_finished).await {
            return state.clone();
        }
        // Task aborted before it finished
        let state = hydrate.borrow();
        state.clone()
    }

    /// Abandon the initial load if it is still running
    pub(crate) fn abort_hydrate(&self) {
        if let Some(hydrate) = self.hydrate_task.lock().take() {
            hydrate.abort();
        }
    }

    /// Wait for the writer to exit, then give back the pooled connection
    ///
    /// The writer only exits once the cell's write hook is gone, so dispose
    /// the cell first. A hydrate still in flight is abandoned. Other users
    /// of the same pooled connection keep it.
    pub(crate) async fn stop(&self) {
        self.abort_hydrate();
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(err) = writer.await {
                tracing::warn!(key = %self.key, error = %err, "writer task ended abnormally");
            }
        }
        if let Some(StorageTarget::Pooled { connection, .. }) = &self.target {
            connection.release();
        }
    }
}

impl fmt::Debug for PersistHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistHandle")
            .field("key", &self.key)
            .field("target", &self.target)
            .field("hydrate", &*self.hydrate.borrow())
            .finish()
    }
}
