//! Flush executor
//!
//! [`TransactionalWriter`] writes every handler's batch in one transaction
//! on a cached database session, with the row-by-row fallback for batch
//! conflicts. [`run_flush_loop`] is the background task that decides when
//! to flush: when the pending count reaches the threshold, or when the
//! maximum wait elapses, whichever comes first.

use metrics::{counter, histogram};
use rmq2db_rdbc::connection::{Connection, ConnectionConfig, ConnectionFactory, Transaction};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::{FlushCoordinator, FlushOutcome};
use crate::error::{BridgeError, Result};
use crate::handler::Handler;

/// Flush trigger configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushSettings {
    /// Pending rows that trigger an immediate flush
    pub count: usize,
    /// Longest wait between flush attempts
    pub max_wait: Duration,
    /// Pause after a failed flush
    pub retry_backoff: Duration,
}

impl Default for FlushSettings {
    fn default() -> Self {
        Self {
            count: 100,
            max_wait: Duration::from_secs(5),
            retry_backoff: Duration::from_secs(5),
        }
    }
}

/// Writes handler batches transactionally over one cached connection
pub struct TransactionalWriter {
    factory: Arc<dyn ConnectionFactory>,
    config: ConnectionConfig,
    conn: Option<Box<dyn Connection>>,
}

impl fmt::Debug for TransactionalWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionalWriter")
            .field("connected", &self.conn.is_some())
            .finish()
    }
}

impl TransactionalWriter {
    /// Create a writer; the first flush opens the connection
    pub fn new(factory: Arc<dyn ConnectionFactory>, config: ConnectionConfig) -> Self {
        Self {
            factory,
            config,
            conn: None,
        }
    }

    /// Write all non-empty handlers in one transaction.
    ///
    /// A batch conflict rolls back and retries the whole flush once in
    /// row-by-row mode. Returns the number of rows written.
    pub async fn write(&mut self, handlers: &[Handler]) -> Result<u64> {
        let rows: usize = handlers.iter().map(Handler::len).sum();
        let started = Instant::now();

        let result = match self.write_once(handlers, rows, false).await {
            Err(BridgeError::ConflictRetryable { table, source }) => {
                counter!("rmq2db.flush.conflict_retries").increment(1);
                warn!(
                    table = %table,
                    rows,
                    error = %source,
                    "Duplicate keys in batch, retrying flush row by row"
                );
                self.write_once(handlers, rows, true).await
            }
            other => other,
        };

        match &result {
            Ok(written) => {
                counter!("rmq2db.rows.flushed").increment(rows as u64);
                histogram!("rmq2db.flush.duration_ms")
                    .record(started.elapsed().as_secs_f64() * 1000.0);
                debug!(rows, written, "Flush committed");
            }
            Err(e) => {
                counter!("rmq2db.flush.failures").increment(1);
                if e.is_connection_lost() {
                    warn!("Database connection lost, reconnecting on next flush");
                    self.conn = None;
                }
            }
        }
        result
    }

    async fn write_once(&mut self, handlers: &[Handler], rows: usize, row_by_row: bool) -> Result<u64> {
        let tx = self.begin(rows).await?;

        let mut written = 0;
        for handler in handlers.iter().filter(|h| !h.is_empty()) {
            match handler.flush_to(tx.as_ref(), row_by_row).await {
                Ok(n) => written += n,
                Err(source) => {
                    if let Err(e) = tx.rollback().await {
                        warn!("Rollback failed: {}", e);
                    }
                    let table = handler.descriptor().table().to_string();
                    return Err(if source.is_batch_conflict() && !row_by_row {
                        BridgeError::ConflictRetryable { table, source }
                    } else {
                        BridgeError::FatalWrite {
                            table,
                            rows: handler.len(),
                            source,
                        }
                    });
                }
            }
        }

        tx.commit()
            .await
            .map_err(|source| BridgeError::Transaction {
                stage: "commit",
                rows,
                source,
            })?;
        Ok(written)
    }

    /// Open a transaction, reconnecting once if a cached session turns out dead
    async fn begin(&mut self, rows: usize) -> Result<Box<dyn Transaction>> {
        let begin_failed = |source: rmq2db_rdbc::Error| BridgeError::Transaction {
            stage: "begin",
            rows,
            source,
        };

        let (conn, fresh) = self.connection(rows).await?;
        let source = match conn.begin().await {
            Ok(tx) => return Ok(tx),
            Err(source) if !fresh && source.is_retriable() => source,
            Err(source) => return Err(begin_failed(source)),
        };

        warn!(error = %source, "Cached database connection failed to begin, reconnecting");
        self.conn = None;
        let (conn, _) = self.connection(rows).await?;
        conn.begin().await.map_err(begin_failed)
    }

    /// The cached session, or a new one; `true` when freshly connected
    async fn connection(&mut self, rows: usize) -> Result<(&dyn Connection, bool)> {
        let mut fresh = false;
        let conn = match self.conn.take() {
            Some(conn) if conn.is_valid().await => conn,
            stale => {
                if stale.is_some() {
                    warn!("Cached database connection is no longer valid");
                }
                let conn = self.factory.connect(&self.config).await.map_err(|source| {
                    BridgeError::Transaction {
                        stage: "connect",
                        rows,
                        source,
                    }
                })?;
                info!("Connected to database");
                fresh = true;
                conn
            }
        };
        Ok((&**self.conn.insert(conn), fresh))
    }

    /// Close the cached session, if any
    pub async fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = conn.close().await {
                warn!("Error closing database connection: {}", e);
            }
        }
    }
}

/// Background flush trigger.
///
/// Waits for the pending count to reach `settings.count`, bounded by
/// `settings.max_wait`, then flushes. A timeout is the time trigger, not an
/// error. After a failed flush the loop pauses for `settings.retry_backoff`.
/// A flush in progress is never interrupted by `shutdown`.
pub async fn run_flush_loop(
    coordinator: Arc<FlushCoordinator>,
    settings: FlushSettings,
    shutdown: CancellationToken,
) {
    info!(
        "Flush loop started (count={}, max_wait={:?})",
        settings.count, settings.max_wait
    );

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = tokio::time::timeout(settings.max_wait, coordinator.await_threshold(settings.count)) => {}
        }

        match coordinator.flush().await {
            Ok(FlushOutcome::Flushed { rows }) => debug!(rows, "Flushed"),
            Ok(FlushOutcome::Idle) => {}
            Err(e) => {
                error!(error = %e, "Flush failed, buffered rows kept for the next attempt");
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(settings.retry_backoff) => {}
                }
            }
        }
    }

    info!("Flush loop stopped");
}
