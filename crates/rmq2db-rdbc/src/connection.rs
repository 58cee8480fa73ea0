//! Connection traits for rmq2db-rdbc
//!
//! Core abstractions for database connectivity:
//! - Connection: one database session
//! - Transaction: explicit BEGIN/COMMIT scope over that session
//! - ConnectionFactory: opens sessions from a [`ConnectionConfig`]
//!
//! Transactions run on the session that opened them, so session-scoped
//! objects (temporary staging tables) survive across transactions.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

use crate::error::Result;
use crate::types::Value;

/// A connection to a database
#[async_trait]
pub trait Connection: Send + Sync {
    /// Execute a statement outside of an explicit transaction
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Begin a transaction
    async fn begin(&self) -> Result<Box<dyn Transaction>>;

    /// Check if connection is valid/alive
    async fn is_valid(&self) -> bool;

    /// Close the connection
    async fn close(&self) -> Result<()>;
}

/// A database transaction
///
/// Dropping a transaction without calling [`commit`](Transaction::commit) or
/// [`rollback`](Transaction::rollback) leaves the session inside the
/// transaction; callers always finish it explicitly.
#[async_trait]
pub trait Transaction: Send + Sync {
    /// Execute a statement that modifies data, returns affected row count
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Stream pre-encoded COPY text data into a `COPY ... FROM STDIN` statement,
    /// returns the number of rows copied
    async fn copy_in(&self, sql: &str, data: Bytes) -> Result<u64>;

    /// Commit the transaction
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Rollback the transaction
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Opens database connections
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Create a new connection
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>>;
}

/// Connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Connection URL / DSN
    pub url: String,
    /// Timeout for establishing the connection
    pub connect_timeout: Duration,
    /// Application name reported to the server
    pub application_name: Option<String>,
}

impl ConnectionConfig {
    /// Create a new config from a URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(10),
            application_name: None,
        }
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the application name
    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_config_builder() {
        let config = ConnectionConfig::new("postgres://localhost/db")
            .with_connect_timeout(Duration::from_secs(3))
            .with_application_name("rmq2db");

        assert_eq!(config.url, "postgres://localhost/db");
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.application_name.as_deref(), Some("rmq2db"));
    }
}
