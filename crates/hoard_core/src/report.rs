//! Subscriber error reporting
//!
//! Fan-out never propagates a subscriber failure to the writer. Failures are
//! handed to an [`ErrorReporter`] instead, one report per failing callback.

use crate::error::CellError;
use parking_lot::Mutex;
use std::sync::Arc;

/// Receives errors caught during subscriber fan-out
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: CellError);
}

/// Default reporter: logs every error through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, error: CellError) {
        tracing::warn!(key = error.key(), "{}", error);
    }
}

/// Reporter that keeps the rendered errors in memory
///
/// Mostly useful in tests and diagnostics overlays.
#[derive(Debug, Default)]
pub struct CollectingReporter {
    errors: Mutex<Vec<String>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rendered messages of every error seen so far
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.errors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.lock().is_empty()
    }

    pub fn clear(&self) {
        self.errors.lock().clear();
    }
}

impl ErrorReporter for CollectingReporter {
    fn report(&self, error: CellError) {
        tracing::debug!(key = error.key(), "collected subscriber error");
        self.errors.lock().push(error.to_string());
    }
}

/// Shared reporter handle
pub type SharedReporter = Arc<dyn ErrorReporter>;

/// The reporter cells use when none is supplied
pub fn default_reporter() -> SharedReporter {
    Arc::new(TracingReporter)
}
