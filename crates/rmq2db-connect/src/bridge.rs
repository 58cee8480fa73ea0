//! Bridge runtime: intake loop plus background flush loop

use futures::{Stream, StreamExt};
use metrics::counter;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broker::InboundMessage;
use crate::buffer::{FlushCoordinator, FlushOutcome};
use crate::decoder::Decoder;
use crate::error::Result;
use crate::flush::{run_flush_loop, FlushSettings, TransactionalWriter};
use crate::handler::HandlerRegistry;

/// Decodes deliveries, buffers rows and drives flushing
#[derive(Debug)]
pub struct Bridge {
    decoder: Decoder,
    coordinator: Arc<FlushCoordinator>,
    settings: FlushSettings,
}

impl Bridge {
    /// Create a bridge over a fixed registry
    pub fn new(registry: Arc<HandlerRegistry>, writer: TransactionalWriter, settings: FlushSettings) -> Self {
        let coordinator = Arc::new(FlushCoordinator::new(&registry, writer));
        Self {
            decoder: Decoder::new(registry),
            coordinator,
            settings,
        }
    }

    /// The coordinator shared with the flush loop
    pub fn coordinator(&self) -> &Arc<FlushCoordinator> {
        &self.coordinator
    }

    /// Flush settings
    pub fn settings(&self) -> FlushSettings {
        self.settings
    }

    /// Decode and buffer one message.
    ///
    /// A rejected message is not buffered; it is still remembered as the
    /// latest delivery so the next acknowledgment covers it.
    pub async fn handle(&self, message: InboundMessage) -> Result<()> {
        match self.decoder.decode(&message) {
            Ok((index, fields)) => self.coordinator.append(index, &fields, message).await,
            Err(e) => {
                self.coordinator.note_rejected(message).await;
                Err(e)
            }
        }
    }

    /// [`handle`](Self::handle) with rejection logging and counting
    pub async fn ingest(&self, message: InboundMessage) {
        counter!("rmq2db.messages.received").increment(1);
        let routing_key = message.routing_key.clone();
        let delivery_tag = message.delivery_tag;

        if let Err(e) = self.handle(message).await {
            counter!("rmq2db.messages.rejected", "reason" => e.reason()).increment(1);
            warn!(
                routing_key = %routing_key,
                delivery_tag,
                error = %e,
                "Rejected message"
            );
        }
    }

    /// Consume `messages` until `shutdown` fires or the stream ends.
    ///
    /// The flush loop runs as a separate task for the duration. On exit the
    /// loop is stopped and one last flush drains whatever is buffered. A
    /// stream error is returned after the drain.
    pub async fn run<S>(&self, mut messages: S, shutdown: CancellationToken) -> Result<()>
    where
        S: Stream<Item = Result<InboundMessage>> + Unpin,
    {
        let loop_token = shutdown.child_token();
        let flush_loop = tokio::spawn(run_flush_loop(
            Arc::clone(&self.coordinator),
            self.settings,
            loop_token.clone(),
        ));

        info!(
            "Bridge running with {} handlers",
            self.decoder.registry().len()
        );

        let mut outcome = Ok(());
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping intake");
                    break;
                }
                next = messages.next() => match next {
                    Some(Ok(message)) => self.ingest(message).await,
                    Some(Err(e)) => {
                        error!("Broker stream failed: {}", e);
                        outcome = Err(e);
                        break;
                    }
                    None => {
                        warn!("Broker stream ended");
                        break;
                    }
                },
            }
        }

        loop_token.cancel();
        if let Err(e) = flush_loop.await {
            error!("Flush loop task failed: {}", e);
        }
        self.drain().await;

        outcome
    }

    /// One final flush, logging the result
    pub async fn drain(&self) {
        match self.coordinator.flush().await {
            Ok(FlushOutcome::Flushed { rows }) => info!("Drained {} buffered rows", rows),
            Ok(FlushOutcome::Idle) => {}
            Err(e) => error!(
                error = %e,
                "Final flush failed, unacknowledged messages will be redelivered"
            ),
        }
    }
}
