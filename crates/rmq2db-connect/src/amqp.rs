//! AMQP adapter (lapin)
//!
//! Opens one connection and one channel, sets the prefetch limit and turns
//! deliveries into [`InboundMessage`]s. The queue is expected to exist and
//! be bound already.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicQosOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use tracing::{info, warn};

use crate::broker::{Acknowledger, InboundMessage};
use crate::config::BrokerConfig;
use crate::error::{BridgeError, Result};

/// Acknowledges on one channel with `multiple = true`
#[derive(Clone)]
pub struct AmqpAcker {
    channel: Channel,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack_up_to(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: true })
            .await
            .map_err(|e| BridgeError::Ack(e.to_string()))
    }
}

/// A connected consumer
pub struct AmqpConsumer {
    connection: Connection,
    channel: Channel,
    queue: String,
    consumer_tag: String,
    timestamp_header: String,
}

impl AmqpConsumer {
    /// Connect, open a channel and set `prefetch`
    pub async fn connect(config: &BrokerConfig, prefetch: u16) -> Result<Self> {
        let connection = Connection::connect(config.url.expose_secret(), ConnectionProperties::default())
            .await
            .map_err(|e| BridgeError::Broker(format!("connect to {}: {}", config.url.redacted_url(), e)))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BridgeError::Broker(format!("open channel: {}", e)))?;

        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BridgeError::Broker(format!("set prefetch: {}", e)))?;

        info!(
            "Connected to broker {} (prefetch={})",
            config.url.redacted_url(),
            prefetch
        );

        Ok(Self {
            connection,
            channel,
            queue: config.queue.clone(),
            consumer_tag: config.consumer_tag.clone(),
            timestamp_header: config.timestamp_header.clone(),
        })
    }

    /// Start consuming the queue with manual acknowledgment
    pub async fn consume(&self) -> Result<impl Stream<Item = Result<InboundMessage>> + Send> {
        let consumer = self
            .channel
            .basic_consume(
                &self.queue,
                &self.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BridgeError::Broker(format!("consume '{}': {}", self.queue, e)))?;

        info!("Consuming queue '{}'", self.queue);

        let acker: Arc<dyn Acknowledger> = Arc::new(AmqpAcker {
            channel: self.channel.clone(),
        });
        let header = self.timestamp_header.clone();

        Ok(consumer.map(move |delivery| -> Result<InboundMessage> {
            let delivery = delivery.map_err(|e| BridgeError::Broker(e.to_string()))?;
            let timestamp_ms = header_timestamp_ms(&delivery.properties, &header);
            Ok(InboundMessage::new(
                delivery.routing_key.as_str(),
                delivery.data,
                delivery.delivery_tag,
                Arc::clone(&acker),
            )
            .with_timestamp_ms(timestamp_ms))
        }))
    }

    /// Close the channel and the connection
    pub async fn close(&self) {
        if let Err(e) = self.channel.close(200, "shutdown").await {
            warn!("Error closing channel: {}", e);
        }
        if let Err(e) = self.connection.close(200, "shutdown").await {
            warn!("Error closing broker connection: {}", e);
        }
    }
}

/// Millisecond timestamp from `header`, falling back to the `timestamp` property
pub fn header_timestamp_ms(properties: &BasicProperties, header: &str) -> Option<i64> {
    let from_header = properties.headers().as_ref().and_then(|headers| {
        headers
            .inner()
            .iter()
            .find(|(name, _)| name.as_str() == header)
            .and_then(|(_, value)| amqp_value_as_i64(value))
    });

    from_header.or_else(|| {
        (*properties.timestamp())
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(|secs| secs.checked_mul(1000))
    })
}

fn amqp_value_as_i64(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongLongInt(v) => Some(*v),
        AMQPValue::Timestamp(v) => i64::try_from(*v).ok(),
        AMQPValue::Float(v) if v.is_finite() => Some(v.round() as i64),
        AMQPValue::Double(v) if v.is_finite() => Some(v.round() as i64),
        _ => None,
    }
}
