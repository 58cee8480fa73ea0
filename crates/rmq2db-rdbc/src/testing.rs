//! In-memory connection for tests
//!
//! [`MockConnection`] records every statement and COPY payload, grouped per
//! transaction, and can be scripted to fail statements whose SQL contains a
//! given substring. Clones share state, so a test keeps one handle while the
//! code under test owns another.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, Transaction};
use crate::error::{Error, Result};
use crate::types::Value;

/// One statement seen by the mock
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedStatement {
    /// SQL text
    pub sql: String,
    /// Bound parameters
    pub params: Vec<Value>,
    /// COPY payload, for `copy_in`
    pub copy_data: Option<Bytes>,
}

impl RecordedStatement {
    /// COPY payload as UTF-8 text
    pub fn copy_text(&self) -> Option<String> {
        self.copy_data
            .as_ref()
            .map(|d| String::from_utf8_lossy(d).into_owned())
    }
}

type ErrorFactory = Box<dyn Fn(&str) -> Error + Send + Sync>;

struct ScriptedFailure {
    pattern: String,
    remaining: usize,
    make: ErrorFactory,
}

#[derive(Default)]
struct MockState {
    committed: Vec<Vec<RecordedStatement>>,
    rolled_back: Vec<Vec<RecordedStatement>>,
    failures: Vec<ScriptedFailure>,
    begun: usize,
    lost: bool,
    closed: bool,
}

impl MockState {
    fn check(&mut self, sql: &str) -> Result<()> {
        if self.lost || self.closed {
            return Err(Error::connection("connection closed"));
        }
        if let Some(failure) = self
            .failures
            .iter_mut()
            .find(|f| f.remaining > 0 && sql.contains(&f.pattern))
        {
            failure.remaining -= 1;
            return Err((failure.make)(sql));
        }
        Ok(())
    }
}

/// Recording in-memory connection
#[derive(Clone, Default)]
pub struct MockConnection {
    state: Arc<Mutex<MockState>>,
}

impl fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockConnection")
            .field("committed", &state.committed.len())
            .field("rolled_back", &state.rolled_back.len())
            .field("lost", &state.lost)
            .finish()
    }
}

impl MockConnection {
    /// Create an empty mock
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` statements whose SQL contains `pattern`
    pub fn fail_on<F>(&self, pattern: impl Into<String>, times: usize, make: F)
    where
        F: Fn(&str) -> Error + Send + Sync + 'static,
    {
        self.state.lock().failures.push(ScriptedFailure {
            pattern: pattern.into(),
            remaining: times,
            make: Box::new(make),
        });
    }

    /// Fail matching statements the way PostgreSQL reports a key updated twice
    pub fn fail_with_batch_conflict(&self, pattern: impl Into<String>, times: usize) {
        self.fail_on(pattern, times, |sql| {
            Error::batch_conflict(
                "ON CONFLICT DO UPDATE command cannot affect row a second time",
                sql,
            )
        });
    }

    /// Every statement from now on fails with a connection error
    pub fn lose_connection(&self) {
        self.state.lock().lost = true;
    }

    /// Statements of each committed transaction, in commit order
    pub fn committed(&self) -> Vec<Vec<RecordedStatement>> {
        self.state.lock().committed.clone()
    }

    /// Statements of each rolled back transaction
    pub fn rolled_back(&self) -> Vec<Vec<RecordedStatement>> {
        self.state.lock().rolled_back.clone()
    }

    /// All committed statements, flattened
    pub fn committed_statements(&self) -> Vec<RecordedStatement> {
        self.state.lock().committed.iter().flatten().cloned().collect()
    }

    /// Number of transactions begun
    pub fn transactions_begun(&self) -> usize {
        self.state.lock().begun
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn execute(&self, sql: &str, _params: &[Value]) -> Result<u64> {
        self.state.lock().check(sql)?;
        Ok(0)
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        let mut state = self.state.lock();
        state.check("BEGIN")?;
        state.begun += 1;
        Ok(Box::new(MockTransaction {
            state: Arc::clone(&self.state),
            statements: Mutex::new(Vec::new()),
        }))
    }

    async fn is_valid(&self) -> bool {
        let state = self.state.lock();
        !state.lost && !state.closed
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().closed = true;
        Ok(())
    }
}

/// Transaction handed out by [`MockConnection`]
pub struct MockTransaction {
    state: Arc<Mutex<MockState>>,
    statements: Mutex<Vec<RecordedStatement>>,
}

#[async_trait]
impl Transaction for MockTransaction {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.state.lock().check(sql)?;
        self.statements.lock().push(RecordedStatement {
            sql: sql.to_string(),
            params: params.to_vec(),
            copy_data: None,
        });
        Ok(1)
    }

    async fn copy_in(&self, sql: &str, data: Bytes) -> Result<u64> {
        self.state.lock().check(sql)?;
        let rows = data.iter().filter(|&&b| b == b'\n').count() as u64;
        self.statements.lock().push(RecordedStatement {
            sql: sql.to_string(),
            params: Vec::new(),
            copy_data: Some(data),
        });
        Ok(rows)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MockTransaction { state, statements } = *self;
        let mut state = state.lock();
        state.check("COMMIT")?;
        state.committed.push(statements.into_inner());
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let MockTransaction { state, statements } = *self;
        let mut state = state.lock();
        if state.lost {
            return Err(Error::connection("connection closed"));
        }
        state.rolled_back.push(statements.into_inner());
        Ok(())
    }
}

/// Factory that hands out clones of one [`MockConnection`]
#[derive(Debug, Clone, Default)]
pub struct MockConnectionFactory {
    connection: MockConnection,
    connects: Arc<Mutex<usize>>,
    refuse: Arc<Mutex<usize>>,
}

impl MockConnectionFactory {
    /// Create a factory around `connection`
    pub fn new(connection: MockConnection) -> Self {
        Self {
            connection,
            connects: Arc::default(),
            refuse: Arc::default(),
        }
    }

    /// The shared connection
    pub fn connection(&self) -> &MockConnection {
        &self.connection
    }

    /// Refuse the next `times` connection attempts
    pub fn refuse_connections(&self, times: usize) {
        *self.refuse.lock() = times;
    }

    /// Successful connection attempts so far
    pub fn connects(&self) -> usize {
        *self.connects.lock()
    }
}

#[async_trait]
impl ConnectionFactory for MockConnectionFactory {
    async fn connect(&self, _config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        {
            let mut refuse = self.refuse.lock();
            if *refuse > 0 {
                *refuse -= 1;
                return Err(Error::connection("connection refused"));
            }
        }
        {
            let mut state = self.connection.state.lock();
            state.lost = false;
            state.closed = false;
        }
        *self.connects.lock() += 1;
        Ok(Box::new(self.connection.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_per_transaction() {
        let conn = MockConnection::new();

        let tx = conn.begin().await.unwrap();
        tx.execute("INSERT 1", &[Value::Int64(1)]).await.unwrap();
        tx.commit().await.unwrap();

        let tx = conn.begin().await.unwrap();
        tx.execute("INSERT 2", &[]).await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(conn.committed().len(), 1);
        assert_eq!(conn.committed()[0][0].params, vec![Value::Int64(1)]);
        assert_eq!(conn.rolled_back()[0][0].sql, "INSERT 2");
        assert_eq!(conn.transactions_begun(), 2);
    }

    #[tokio::test]
    async fn test_scripted_failure_is_consumed() {
        let conn = MockConnection::new();
        conn.fail_with_batch_conflict("ON CONFLICT", 1);

        let tx = conn.begin().await.unwrap();
        let err = tx.execute("INSERT ... ON CONFLICT", &[]).await.unwrap_err();
        assert!(err.is_batch_conflict());
        assert!(tx.execute("INSERT ... ON CONFLICT", &[]).await.is_ok());
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_lost_connection() {
        let conn = MockConnection::new();
        conn.lose_connection();
        assert!(!conn.is_valid().await);
        assert!(conn.begin().await.is_err());

        let factory = MockConnectionFactory::new(conn.clone());
        let fresh = factory
            .connect(&ConnectionConfig::new("mock://"))
            .await
            .unwrap();
        assert!(fresh.is_valid().await);
        assert_eq!(factory.connects(), 1);
    }
}
