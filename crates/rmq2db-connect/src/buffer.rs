//! Buffer/flush coordinator
//!
//! Shared state behind one lock: every handler's buffer, the pending row
//! count and the latest unacknowledged delivery. The pending count is also
//! published on a watch channel so the flush loop can wait for the threshold
//! without polling.
//!
//! A flush detaches the buffered rows under the lock and writes them with the
//! lock released, so intake keeps running while the database works. Flushes
//! are serialized by the writer lock. On failure the detached rows are put
//! back in front of anything that arrived meanwhile.

use metrics::gauge;
use std::fmt;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use crate::broker::InboundMessage;
use crate::error::{BridgeError, Result};
use crate::flush::TransactionalWriter;
use crate::handler::{FieldMap, Handler, HandlerRegistry};

/// What a call to [`FlushCoordinator::flush`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was waiting for acknowledgment
    Idle,
    /// Rows were committed (possibly zero) and the latest delivery was acknowledged
    Flushed {
        /// Rows committed
        rows: usize,
    },
}

struct BufferState {
    handlers: Vec<Handler>,
    latest: Option<InboundMessage>,
    pending: usize,
}

/// Serializes buffer mutation and flushing.
///
/// Between flushes the buffered rows of all handlers add up to
/// [`pending`](Self::pending). While a flush is in flight its detached batch
/// is held outside the handler buffers, so [`buffered`](Self::buffered) can
/// report fewer rows than `pending` until the flush commits or restores them.
pub struct FlushCoordinator {
    state: Mutex<BufferState>,
    pending_tx: watch::Sender<usize>,
    writer: Mutex<TransactionalWriter>,
}

impl fmt::Debug for FlushCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlushCoordinator")
            .field("pending", &*self.pending_tx.borrow())
            .finish()
    }
}

impl FlushCoordinator {
    /// Create a coordinator with one empty buffer per registered handler
    pub fn new(registry: &HandlerRegistry, writer: TransactionalWriter) -> Self {
        let (pending_tx, _) = watch::channel(0);
        Self {
            state: Mutex::new(BufferState {
                handlers: registry.handlers(),
                latest: None,
                pending: 0,
            }),
            pending_tx,
            writer: Mutex::new(writer),
        }
    }

    /// Append a row for handler `index` and remember `message` as the latest delivery.
    ///
    /// If a declared field is missing nothing is appended, but the message
    /// still becomes the latest delivery so a later acknowledgment covers it.
    pub async fn append(&self, index: usize, fields: &FieldMap, message: InboundMessage) -> Result<()> {
        let mut state = self.state.lock().await;
        let handler = state.handlers.get_mut(index).ok_or_else(|| {
            BridgeError::Config(format!("no handler at index {}", index))
        })?;

        let appended = handler.append(fields);
        state.latest = Some(message);
        appended?;

        state.pending += 1;
        self.publish(state.pending);
        Ok(())
    }

    /// Remember a rejected message as the latest delivery without adding a row
    pub async fn note_rejected(&self, message: InboundMessage) {
        self.state.lock().await.latest = Some(message);
    }

    /// Wait until at least `count` rows are pending.
    ///
    /// Callers bound this with a timeout; the condition is rechecked on
    /// every change of the counter.
    pub async fn await_threshold(&self, count: usize) {
        let mut rx = self.pending_tx.subscribe();
        // The sender lives as long as `self`
        let _ = rx.wait_for(|&pending| pending >= count).await;
    }

    /// Pending row count
    pub fn pending(&self) -> usize {
        *self.pending_tx.borrow()
    }

    /// Buffered rows per handler key, in registration order
    pub async fn buffered(&self) -> Vec<(String, usize)> {
        self.state
            .lock()
            .await
            .handlers
            .iter()
            .map(|h| (h.descriptor().key().to_string(), h.len()))
            .collect()
    }

    /// Delivery tag of the latest unacknowledged message
    pub async fn latest_delivery_tag(&self) -> Option<u64> {
        self.state
            .lock()
            .await
            .latest
            .as_ref()
            .map(|m| m.delivery_tag)
    }

    /// Write every buffered row in one transaction, then acknowledge cumulatively.
    ///
    /// No-op when nothing awaits acknowledgment. On a write error the rows
    /// stay buffered and nothing is acknowledged. If only the acknowledgment
    /// fails, the committed rows are dropped but the latest delivery is kept
    /// so the next flush retries the acknowledgment.
    ///
    /// `pending` only drops once the write has committed, so it counts the
    /// in-flight batch while the handler buffers no longer hold it.
    pub async fn flush(&self) -> Result<FlushOutcome> {
        let mut writer = self.writer.lock().await;

        let (batch, latest, rows) = {
            let mut state = self.state.lock().await;
            let Some(latest) = state.latest.clone() else {
                return Ok(FlushOutcome::Idle);
            };
            let batch: Vec<Handler> = state.handlers.iter_mut().map(Handler::take_batch).collect();
            let rows = batch.iter().map(Handler::len).sum::<usize>();
            (batch, latest, rows)
        };

        if rows > 0 {
            if let Err(e) = writer.write(&batch).await {
                let mut state = self.state.lock().await;
                for (handler, taken) in state.handlers.iter_mut().zip(batch) {
                    handler.restore(taken);
                }
                return Err(e);
            }
        }
        drop(batch);

        let acked = latest.ack_cumulative().await;

        let mut state = self.state.lock().await;
        state.pending = state.pending.saturating_sub(rows);
        self.publish(state.pending);

        match acked {
            Ok(()) => {
                if state
                    .latest
                    .as_ref()
                    .is_some_and(|m| m.delivery_tag == latest.delivery_tag)
                {
                    state.latest = None;
                }
                debug!(rows, delivery_tag = latest.delivery_tag, "Acknowledged");
                Ok(FlushOutcome::Flushed { rows })
            }
            Err(e) => {
                warn!(
                    rows,
                    delivery_tag = latest.delivery_tag,
                    "Rows committed but acknowledgment failed"
                );
                Err(e)
            }
        }
    }

    /// Close the writer's database session
    pub async fn close(&self) {
        self.writer.lock().await.close().await;
    }

    fn publish(&self, pending: usize) {
        self.pending_tx.send_replace(pending);
        gauge!("rmq2db.pending.rows").set(pending as f64);
    }
}
