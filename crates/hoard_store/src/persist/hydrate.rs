//! One-shot load of the stored value into a freshly created cell

use super::codec::SharedCodec;
use super::target::StorageTarget;
use hoard_core::{CellEvent, CellValue, EventKind, WeakCell};
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;

/// Where a persisted cell is in its initial load
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HydrateState {
    /// The read is scheduled or in flight; the cell shows its initial value
    Pending,
    /// A stored value replaced the initial value
    Loaded,
    /// Nothing was stored under the key
    Empty,
    /// A stored value was found but the cell was dropped or disposed
    /// before it arrived
    Skipped,
    /// The read or decode failed; the cell keeps its initial value
    Failed(String),
    /// The read outlived the configured timeout
    TimedOut,
    /// Persistence could not be set up; the cell is memory-only
    Unavailable(String),
}

impl HydrateState {
    /// Whether the initial load has reached a final state
    pub fn is_finished(&self) -> bool {
        !matches!(self, HydrateState::Pending)
    }

    /// Whether the cell now holds the stored value
    pub fn is_loaded(&self) -> bool {
        matches!(self, HydrateState::Loaded)
    }
}

impl fmt::Display for HydrateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HydrateState::Pending => write!(f, "pending"),
            HydrateState::Loaded => write!(f, "loaded"),
            HydrateState::Empty => write!(f, "empty"),
            HydrateState::Skipped => write!(f, "skipped"),
            HydrateState::Failed(reason) => write!(f, "failed: {reason}"),
            HydrateState::TimedOut => write!(f, "timed out"),
            HydrateState::Unavailable(reason) => write!(f, "unavailable: {reason}"),
        }
    }
}

pub(crate) struct HydrateTask<T> {
    pub(crate) key: String,
    pub(crate) target: StorageTarget,
    pub(crate) codec: SharedCodec<T>,
    pub(crate) cell: WeakCell<T>,
    /// Cell version when persistence was attached
    pub(crate) created_version: u64,
    pub(crate) timeout: Option<Duration>,
    pub(crate) state: watch::Sender<HydrateState>,
}

impl<T: CellValue> HydrateTask<T> {
    pub(crate) async fn run(self) {
        let read = self.target.read();
        let outcome = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, read).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(
                        key = %self.key,
                        op = "hydrate",
                        timeout_ms = limit.as_millis() as u64,
                        "hydrate timed out, keeping initial value"
                    );
                    self.finish(HydrateState::TimedOut);
                    return;
                }
            },
            None => read.await,
        };

        let state = match outcome {
            Ok(Some(text)) => self.apply(&text),
            Ok(None) => {
                tracing::debug!(key = %self.key, target = %self.target, "nothing stored");
                HydrateState::Empty
            }
            Err(err) => {
                tracing::warn!(key = %self.key, op = "read", target = %self.target, error = %err, "hydrate failed");
                HydrateState::Failed(err.to_string())
            }
        };

        self.finish(state);
    }

    fn apply(&self, text: &str) -> HydrateState {
        let value = match self.codec.decode(text) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(key = %self.key, op = "decode", error = %err, "stored value unreadable");
                return HydrateState::Failed(err.to_string());
            }
        };
        let Some(cell) = self.cell.upgrade() else {
            return HydrateState::Skipped;
        };

        if cell.version() != self.created_version {
            tracing::debug!(key = %self.key, "stored value replaces local writes made before hydrate");
        }
        if cell.apply_loaded(value.clone(), self.created_version).is_err() {
            return HydrateState::Skipped;
        }
        tracing::debug!(key = %self.key, target = %self.target, "hydrated from storage");
        if cell.emits_events() {
            cell.emit_event(
                CellEvent::new(EventKind::LoadedFromStorage, self.key.clone()).with_value(value),
            );
        }
        HydrateState::Loaded
    }

    /// Publish the final state after `InitialLoadComplete`
    ///
    /// Failures are logged and kept in the state; they do not emit `Error`.
    fn finish(&self, state: HydrateState) {
        if let Some(cell) = self.cell.upgrade().filter(|cell| cell.emits_events()) {
            cell.emit_event(
                CellEvent::new(EventKind::InitialLoadComplete, self.key.clone())
                    .with_value(cell.get()),
            );
        }
        self.state.send_replace(state);
    }
}
