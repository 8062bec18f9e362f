//! Hoard Store
//!
//! Keyed reactive state with debounced persistence, built on `hoard_core`:
//!
//! - **Registry**: [`NamedRegistry`] hands out one [`ObservableCell`] per key
//! - **Persistence**: cells can mirror themselves to a synchronous key-value
//!   store or to a pooled asynchronous database, loading the stored value on
//!   creation and writing updates after a debounce window
//! - **Lists**: [`ListProjection`] keeps a list cell and one cell per item in
//!   step, with subscriptions to items that do not exist yet
//!
//! # Example
//!
//! ```rust
//! use hoard_store::{NamedRegistry, PersistOptions};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> hoard_store::Result<()> {
//! let registry = NamedRegistry::in_memory();
//!
//! let theme = registry.get_or_create(
//!     "theme",
//!     "light".to_string(),
//!     Some(PersistOptions::json()),
//! )?;
//! registry.hydrated("theme").await;
//!
//! theme.update("dark".to_string())?;
//! assert!(registry.flush("theme").await?);
//!
//! registry.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod list;
#[cfg(feature = "subscriber")]
pub mod logging;
pub mod persist;
pub mod registry;

pub use config::{StoreConfig, CONFIG_FILE};
pub use error::{CodecError, Result, StorageError, StoreError};
pub use list::{ItemId, ListEvent, ListProjection};
pub use persist::{
    BackendKind, Codec, ConnectionPool, Connector, Database, FileStore, FnCodec, HydrateState,
    JsonCodec, KeyValueStore, MemoryConnector, MemoryStore, PersistHandle, PersistOptions,
    PooledConnection, StorageTarget,
};
#[cfg(feature = "sqlite")]
pub use persist::SqliteConnector;
pub use registry::{NamedRegistry, RegistryBuilder};

pub use hoard_core::{
    CellError, CellEvent, CellValue, CollectingReporter, ErrorReporter, EventBus, EventKind,
    ObservableCell, SharedReporter, Subscription, TracingReporter,
};
