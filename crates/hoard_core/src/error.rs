//! Error types for hoard_core

use thiserror::Error;

/// Errors raised by observable cells and their subscribers
#[derive(Error, Debug)]
pub enum CellError {
    /// The cell was disposed and no longer accepts writes
    #[error("cell `{0}` has been disposed")]
    Disposed(String),

    /// A fallible subscriber returned an error
    #[error("subscriber `{subscriber}` on `{key}` failed: {source}")]
    Callback {
        key: String,
        subscriber: String,
        #[source]
        source: anyhow::Error,
    },

    /// A subscriber panicked while being notified
    #[error("subscriber `{subscriber}` on `{key}` panicked: {message}")]
    Panicked {
        key: String,
        subscriber: String,
        message: String,
    },
}

impl CellError {
    /// Key of the cell the error belongs to
    pub fn key(&self) -> &str {
        match self {
            CellError::Disposed(key) => key,
            CellError::Callback { key, .. } | CellError::Panicked { key, .. } => key,
        }
    }
}

/// Result type for hoard_core operations
pub type Result<T> = std::result::Result<T, CellError>;
