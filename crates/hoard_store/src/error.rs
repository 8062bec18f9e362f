//! Error types for hoard_store

use thiserror::Error;

/// Failures of a storage backend
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "sqlite")]
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("malformed storage file: {0}")]
    Json(#[from] serde_json::Error),

    /// Database or store names are used as file and table names
    #[error("invalid storage name `{0}`")]
    InvalidName(String),

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("storage task failed: {0}")]
    Join(String),

    #[error("{0}")]
    Other(String),
}

/// A value could not be encoded or decoded
#[derive(Error, Debug)]
#[error("codec failed: {0}")]
pub struct CodecError(pub String);

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        CodecError(err.to_string())
    }
}

/// Errors returned by the registry and persistence layer
#[derive(Error, Debug)]
pub enum StoreError {
    /// A non-creating accessor was asked for an unknown key
    #[error("no cell registered under `{0}`")]
    NotFound(String),

    /// The key exists but holds a different value type
    #[error("cell `{key}` holds `{found}`, not `{expected}`")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("storage error on `{key}` during {op}: {source}")]
    Storage {
        key: String,
        op: &'static str,
        #[source]
        source: StorageError,
    },

    #[error("codec error on `{key}`: {source}")]
    Codec {
        key: String,
        #[source]
        source: CodecError,
    },

    /// Persistence was requested in a way this registry cannot serve
    #[error("configuration error on `{key}`: {message}")]
    Config { key: String, message: String },

    #[error("no async runtime available for `{0}`")]
    NoRuntime(String),

    /// The persistence worker for this key has stopped
    #[error("persistence for `{0}` is closed")]
    Closed(String),

    #[error(transparent)]
    Cell(#[from] hoard_core::CellError),
}

impl StoreError {
    pub(crate) fn storage(key: &str, op: &'static str, source: StorageError) -> Self {
        StoreError::Storage {
            key: key.to_string(),
            op,
            source,
        }
    }
}

/// Result type for hoard_store operations
pub type Result<T> = std::result::Result<T, StoreError>;
