//! Broker-neutral message envelope.
//!
//! The core only sees [`InboundMessage`]s and acknowledges them through an
//! [`Acknowledger`]; the AMQP specifics live in [`crate::amqp`].

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;

/// Cumulative acknowledgment of deliveries on one channel
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Acknowledge `delivery_tag` and every earlier unacknowledged delivery
    async fn ack_up_to(&self, delivery_tag: u64) -> Result<()>;
}

/// One delivery from the broker
#[derive(Clone)]
pub struct InboundMessage {
    /// Routing key, `<prefix>.<logical-key>.<encoding>`
    pub routing_key: String,
    /// Raw body
    pub body: Bytes,
    /// Millisecond timestamp from the message headers, if any
    pub timestamp_ms: Option<i64>,
    /// Channel-scoped delivery tag
    pub delivery_tag: u64,
    acker: Arc<dyn Acknowledger>,
}

impl InboundMessage {
    /// Create a message
    pub fn new(
        routing_key: impl Into<String>,
        body: impl Into<Bytes>,
        delivery_tag: u64,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            routing_key: routing_key.into(),
            body: body.into(),
            timestamp_ms: None,
            delivery_tag,
            acker,
        }
    }

    /// Set the header timestamp (milliseconds since the epoch)
    pub fn with_timestamp_ms(mut self, timestamp_ms: Option<i64>) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    /// Acknowledge this message and everything delivered before it
    pub async fn ack_cumulative(&self) -> Result<()> {
        self.acker.ack_up_to(self.delivery_tag).await
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("routing_key", &self.routing_key)
            .field("body_len", &self.body.len())
            .field("timestamp_ms", &self.timestamp_ms)
            .field("delivery_tag", &self.delivery_tag)
            .finish()
    }
}
