//! Debounced write coalescing
//!
//! Each persisted cell owns one writer task. The cell's write hook pushes
//! every updated value into the task's channel; the task keeps only the
//! latest one and writes it once the debounce window passes without a newer
//! value. A flush request writes the buffered value immediately. When the
//! value channel closes (the cell was disposed) the buffered value is written
//! before the task exits, so stopping a writer never drops an update.

use super::codec::SharedCodec;
use super::target::StorageTarget;
use crate::error::{Result, StoreError};
use hoard_core::{CellEvent, CellValue, EventKind, WeakCell};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Requests sent to a writer task outside the value stream
pub(crate) enum Control {
    /// Write the buffered value now; replies whether anything was written
    Flush(oneshot::Sender<Result<bool>>),
}

pub(crate) struct WriterTask<T> {
    pub(crate) key: String,
    pub(crate) target: StorageTarget,
    pub(crate) codec: SharedCodec<T>,
    pub(crate) debounce: Duration,
    pub(crate) cell: WeakCell<T>,
}

impl<T: CellValue> WriterTask<T> {
    pub(crate) async fn run(
        self,
        mut values: mpsc::UnboundedReceiver<T>,
        mut control: mpsc::UnboundedReceiver<Control>,
    ) {
        let mut pending: Option<T> = None;
        let mut control_open = true;

        tracing::debug!(key = %self.key, target = %self.target, "writer started");
        loop {
            // Values are polled before control so a flush sees every value
            // sent ahead of it.
            tokio::select! {
                biased;

                value = values.recv() => match value {
                    Some(value) => pending = Some(value),
                    None => {
                        let _ = self.write_pending(&mut pending).await;
                        break;
                    }
                },

                command = control.recv(), if control_open => match command {
                    Some(Control::Flush(reply)) => {
                        let result = self.write_pending(&mut pending).await;
                        let _ = reply.send(result);
                    }
                    None => control_open = false,
                },

                _ = tokio::time::sleep(self.debounce), if pending.is_some() => {
                    let _ = self.write_pending(&mut pending).await;
                }
            }
        }
        tracing::debug!(key = %self.key, "writer stopped");
    }

    async fn write_pending(&self, pending: &mut Option<T>) -> Result<bool> {
        match pending.take() {
            Some(value) => self.write(value).await.map(|()| true),
            None => Ok(false),
        }
    }

    async fn write(&self, value: T) -> Result<()> {
        let text = match self.codec.encode(&value) {
            Ok(text) => text,
            Err(source) => {
                tracing::warn!(key = %self.key, op = "encode", error = %source, "persist skipped");
                self.emit(EventKind::Error, None, Some(source.to_string()));
                return Err(StoreError::Codec {
                    key: self.key.clone(),
                    source,
                });
            }
        };

        match self.target.write(text).await {
            Ok(()) => {
                tracing::trace!(key = %self.key, target = %self.target, "persisted");
                self.emit(EventKind::Persisted, Some(value), None);
                Ok(())
            }
            Err(source) => {
                tracing::warn!(
                    key = %self.key,
                    op = "write",
                    target = %self.target,
                    error = %source,
                    "persist failed"
                );
                self.emit(EventKind::Error, None, Some(source.to_string()));
                Err(StoreError::storage(&self.key, "write", source))
            }
        }
    }

    fn emit(&self, kind: EventKind, value: Option<T>, error: Option<String>) {
        let Some(cell) = self.cell.upgrade() else {
            return;
        };
        if !cell.emits_events() {
            return;
        }
        let mut event = CellEvent::new(kind, self.key.clone());
        event.value = value;
        event.error = error;
        cell.emit_event(event);
    }
}
