//! Error types for rmq2db-connect
//!
//! Two families share one enum:
//! - Per-message errors (decode and routing). They reject one message and
//!   never stop intake.
//! - Flush errors. They abort the whole flush; buffered rows stay for the next
//!   attempt and nothing is acknowledged.

use thiserror::Error;

/// Result type alias for the bridge runtime
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Main error type for rmq2db-connect
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum BridgeError {
    /// Encoding tag of the routing key is not understood
    #[error("unsupported encoding '{encoding}' in routing key '{routing_key}'")]
    UnsupportedEncoding {
        routing_key: String,
        encoding: String,
    },

    /// Body could not be decoded into a field map
    #[error("malformed payload on '{routing_key}': {message}")]
    MalformedPayload {
        routing_key: String,
        message: String,
    },

    /// No handler is registered for the logical key
    #[error("no handler registered for routing key '{routing_key}'")]
    UnknownRoutingKey { routing_key: String },

    /// A declared field is absent from the decoded message
    #[error("message for '{key}' is missing field '{field}'")]
    MissingField { key: String, field: String },

    /// A set-based upsert touched the same key twice; the flush is retried row by row
    #[error("batch conflict writing '{table}'")]
    ConflictRetryable {
        table: String,
        #[source]
        source: rmq2db_rdbc::Error,
    },

    /// Writing a table failed for good in this flush attempt
    #[error("writing {rows} rows to '{table}' failed: {source}")]
    FatalWrite {
        table: String,
        rows: usize,
        #[source]
        source: rmq2db_rdbc::Error,
    },

    /// Connecting, BEGIN or COMMIT failed
    #[error("{stage} failed with {rows} rows pending: {source}")]
    Transaction {
        stage: &'static str,
        rows: usize,
        #[source]
        source: rmq2db_rdbc::Error,
    },

    /// Cumulative acknowledgment failed after a successful commit
    #[error("acknowledgment failed: {0}")]
    Ack(String),

    /// Broker connection or consumer error
    #[error("broker error: {0}")]
    Broker(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    /// Whether the error rejects a single message rather than a flush
    pub fn is_message_error(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedEncoding { .. }
                | Self::MalformedPayload { .. }
                | Self::UnknownRoutingKey { .. }
                | Self::MissingField { .. }
        )
    }

    /// Short label for metrics
    pub fn reason(&self) -> &'static str {
        match self {
            Self::UnsupportedEncoding { .. } => "unsupported_encoding",
            Self::MalformedPayload { .. } => "malformed_payload",
            Self::UnknownRoutingKey { .. } => "unknown_routing_key",
            Self::MissingField { .. } => "missing_field",
            Self::ConflictRetryable { .. } => "conflict",
            Self::FatalWrite { .. } => "write",
            Self::Transaction { .. } => "transaction",
            Self::Ack(_) => "ack",
            Self::Broker(_) => "broker",
            Self::Config(_) => "config",
        }
    }

    /// Underlying database error, if any
    pub fn database_error(&self) -> Option<&rmq2db_rdbc::Error> {
        match self {
            Self::ConflictRetryable { source, .. }
            | Self::FatalWrite { source, .. }
            | Self::Transaction { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Whether the database session should be dropped and reopened
    pub fn is_connection_lost(&self) -> bool {
        self.database_error().is_some_and(|e| e.is_retriable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_errors() {
        let err = BridgeError::UnknownRoutingKey {
            routing_key: "sensors.garage.json".into(),
        };
        assert!(err.is_message_error());
        assert_eq!(err.reason(), "unknown_routing_key");
        assert!(err.to_string().contains("sensors.garage.json"));
    }

    #[test]
    fn test_flush_errors_expose_database_error() {
        let err = BridgeError::FatalWrite {
            table: "strom".into(),
            rows: 3,
            source: rmq2db_rdbc::Error::connection("server closed the connection"),
        };
        assert!(!err.is_message_error());
        assert!(err.is_connection_lost());
        assert!(err.to_string().contains("3 rows"));
        assert!(err.to_string().contains("strom"));

        let err = BridgeError::Transaction {
            stage: "commit",
            rows: 1,
            source: rmq2db_rdbc::Error::query("deadlock detected"),
        };
        assert!(!err.is_connection_lost());
        assert!(err.to_string().starts_with("commit failed"));
    }
}
