//! Hoard Core
//!
//! This crate provides the reactive primitives the Hoard store is built on:
//!
//! - **Observable cells**: one value, keyed subscribers, replay-of-one on subscribe
//! - **Lifecycle events**: a per-cell side channel for loaded/updated/persisted/error
//! - **Error reporting**: subscriber failures are caught per callback and reported,
//!   never propagated into the writer
//!
//! # Example
//!
//! ```rust
//! use hoard_core::{CellEvent, EventKind, ObservableCell};
//!
//! let cell = ObservableCell::named("theme", "light".to_string());
//! cell.set_emit_events(true);
//!
//! let _events = cell.subscribe_events("audit", |event: &CellEvent<String>| {
//!     assert_eq!(event.kind, EventKind::ValueUpdated);
//! });
//!
//! cell.update("dark".to_string()).unwrap();
//! assert_eq!(cell.get(), "dark");
//! ```

pub mod cell;
pub mod error;
pub mod events;
pub mod report;
pub mod subscribers;

pub use cell::{CellValue, ObservableCell, WeakCell, WriteHook};
pub use error::{CellError, Result};
pub use events::{CellEvent, EventBus, EventKind};
pub use report::{default_reporter, CollectingReporter, ErrorReporter, SharedReporter, TracingReporter};
pub use subscribers::{Callback, Subscription};
