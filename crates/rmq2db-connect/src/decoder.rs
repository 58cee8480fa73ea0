//! Routing key parsing and payload decoding
//!
//! Routing keys look like `<prefix>.<logical-key>.<encoding>`. Only the last
//! two segments matter; the prefix may itself contain dots or be absent.

use chrono::{DateTime, TimeZone, Utc};
use rmq2db_rdbc::types::Value;
use std::str::FromStr;
use std::sync::Arc;

use crate::broker::InboundMessage;
use crate::error::{BridgeError, Result};
use crate::handler::{FieldMap, HandlerRegistry, TIME_FIELD};

/// Payload encodings understood by the decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// A JSON object, one field per column
    Json,
}

impl FromStr for Encoding {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "json" => Ok(Self::Json),
            _ => Err(()),
        }
    }
}

/// Split a routing key into `(logical_key, encoding)`
pub fn parse_routing_key(routing_key: &str) -> Result<(&str, &str)> {
    let mut segments = routing_key.rsplitn(3, '.');
    let encoding = segments.next();
    let key = segments.next();
    match (key, encoding) {
        (Some(key), Some(encoding)) if !key.is_empty() => Ok((key, encoding)),
        _ => Err(BridgeError::UnknownRoutingKey {
            routing_key: routing_key.to_string(),
        }),
    }
}

/// Turns inbound messages into `(handler index, fields)`
#[derive(Debug, Clone)]
pub struct Decoder {
    registry: Arc<HandlerRegistry>,
}

impl Decoder {
    /// Create a decoder over a registry
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    /// The registry used for lookups
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Decode one message.
    ///
    /// Checks run in order: encoding tag, payload, handler lookup, time
    /// injection. Missing declared fields are detected later, on append.
    pub fn decode(&self, message: &InboundMessage) -> Result<(usize, FieldMap)> {
        let routing_key = message.routing_key.as_str();
        let (key, encoding) = parse_routing_key(routing_key)?;

        let encoding = encoding
            .parse::<Encoding>()
            .map_err(|()| BridgeError::UnsupportedEncoding {
                routing_key: routing_key.to_string(),
                encoding: encoding.to_string(),
            })?;

        let mut fields = match encoding {
            Encoding::Json => decode_json(routing_key, &message.body)?,
        };

        let (index, descriptor) =
            self.registry
                .lookup(key)
                .ok_or_else(|| BridgeError::UnknownRoutingKey {
                    routing_key: routing_key.to_string(),
                })?;

        if descriptor.needs_time() {
            let time = event_time(routing_key, key, fields.get(TIME_FIELD), message.timestamp_ms)?;
            fields.insert(TIME_FIELD.to_string(), Value::Timestamp(time));
        }

        Ok((index, fields))
    }
}

fn decode_json(routing_key: &str, body: &[u8]) -> Result<FieldMap> {
    let malformed = |message: String| BridgeError::MalformedPayload {
        routing_key: routing_key.to_string(),
        message,
    };

    let parsed: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| malformed(e.to_string()))?;
    match parsed {
        serde_json::Value::Object(map) => Ok(map
            .into_iter()
            .map(|(name, value)| (name, Value::from(value)))
            .collect()),
        other => Err(malformed(format!(
            "expected a JSON object, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

/// Payload "time" (epoch seconds) wins over the header (epoch milliseconds)
fn event_time(
    routing_key: &str,
    key: &str,
    payload_time: Option<&Value>,
    header_ms: Option<i64>,
) -> Result<DateTime<Utc>> {
    let out_of_range = || BridgeError::MalformedPayload {
        routing_key: routing_key.to_string(),
        message: "time is out of range".to_string(),
    };

    match payload_time {
        Some(Value::Int64(secs)) => Utc
            .timestamp_opt(*secs, 0)
            .single()
            .ok_or_else(out_of_range),
        Some(Value::Float64(secs)) => from_fractional_secs(*secs).ok_or_else(out_of_range),
        Some(Value::Timestamp(ts)) => Ok(*ts),
        None | Some(Value::Null) => match header_ms {
            Some(ms) => DateTime::from_timestamp_millis(ms).ok_or_else(out_of_range),
            None => Err(BridgeError::MissingField {
                key: key.to_string(),
                field: TIME_FIELD.to_string(),
            }),
        },
        Some(other) => Err(BridgeError::MalformedPayload {
            routing_key: routing_key.to_string(),
            message: format!("time must be numeric epoch seconds, got {}", other.sql_type()),
        }),
    }
}

fn from_fractional_secs(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    let micros = (secs * 1_000_000.0).round();
    if micros < i64::MIN as f64 || micros > i64::MAX as f64 {
        return None;
    }
    DateTime::from_timestamp_micros(micros as i64)
}
