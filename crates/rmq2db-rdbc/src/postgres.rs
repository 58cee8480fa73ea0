//! PostgreSQL backend implementation for rmq2db-rdbc
//!
//! Provides PostgreSQL-specific implementations:
//! - Connection with a per-session prepared statement cache
//! - Explicit BEGIN/COMMIT transactions on that session
//! - COPY FROM STDIN streaming
//! - Server error classification (batch conflicts, unique violations, lost connections)

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::SinkExt;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::{Client, Statement};
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, Transaction};
use crate::error::{Error, Result};
use crate::types::Value;

/// Cached statements per session before the cache is reset
const STATEMENT_CACHE_CAPACITY: usize = 256;

const BATCH_CONFLICT_MESSAGE: &str = "cannot affect row a second time";

type ParamResult = std::result::Result<IsNull, Box<dyn std::error::Error + Sync + Send>>;

/// Binds a [`Value`] to whatever type the server inferred for the placeholder.
///
/// The upsert statements carry no casts, so the server decides each
/// parameter's type from the target column and the value is converted here.
#[derive(Debug)]
struct PgParam<'a>(&'a Value);

fn mismatch(value: &Value, ty: &Type) -> Box<dyn std::error::Error + Sync + Send> {
    format!("cannot bind {} value to column of type {}", value.sql_type(), ty).into()
}

impl ToSql for PgParam<'_> {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> ParamResult {
        let value = self.0;
        if value.is_null() {
            return Ok(IsNull::Yes);
        }

        match *ty {
            Type::BOOL => value
                .as_bool()
                .ok_or_else(|| mismatch(value, ty))?
                .to_sql(ty, out),
            Type::INT2 => {
                let n = value.as_i64().ok_or_else(|| mismatch(value, ty))?;
                i16::try_from(n)?.to_sql(ty, out)
            }
            Type::INT4 => {
                let n = value.as_i64().ok_or_else(|| mismatch(value, ty))?;
                i32::try_from(n)?.to_sql(ty, out)
            }
            Type::INT8 => value
                .as_i64()
                .ok_or_else(|| mismatch(value, ty))?
                .to_sql(ty, out),
            Type::FLOAT4 => {
                let n = value.as_f64().ok_or_else(|| mismatch(value, ty))?;
                (n as f32).to_sql(ty, out)
            }
            Type::FLOAT8 => value
                .as_f64()
                .ok_or_else(|| mismatch(value, ty))?
                .to_sql(ty, out),
            Type::NUMERIC => {
                let decimal = match value {
                    Value::Int64(n) => rust_decimal::Decimal::from(*n),
                    Value::Float64(n) => rust_decimal::Decimal::try_from(*n)?,
                    Value::String(s) => rust_decimal::Decimal::from_str(s.trim())?,
                    _ => return Err(mismatch(value, ty)),
                };
                decimal.to_sql(ty, out)
            }
            Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => value
                .to_text()
                .ok_or_else(|| mismatch(value, ty))?
                .to_sql(ty, out),
            Type::JSON | Type::JSONB => value.to_json().to_sql(ty, out),
            Type::TIMESTAMPTZ => value
                .as_timestamp()
                .ok_or_else(|| mismatch(value, ty))?
                .to_sql(ty, out),
            Type::TIMESTAMP => value
                .as_timestamp()
                .ok_or_else(|| mismatch(value, ty))?
                .naive_utc()
                .to_sql(ty, out),
            Type::DATE => value
                .as_timestamp()
                .ok_or_else(|| mismatch(value, ty))?
                .date_naive()
                .to_sql(ty, out),
            _ => Err(mismatch(value, ty)),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Server errors with a dedicated [`Error`] variant; anything else stays a query error
fn classify_db_error(
    code: &SqlState,
    message: &str,
    constraint: Option<&str>,
    sql: &str,
) -> Option<Error> {
    if *code == SqlState::CARDINALITY_VIOLATION && message.contains(BATCH_CONFLICT_MESSAGE) {
        Some(Error::batch_conflict(message, sql))
    } else if *code == SqlState::UNIQUE_VIOLATION {
        Some(Error::Constraint {
            constraint_name: constraint.unwrap_or("unknown").to_string(),
            message: message.to_string(),
        })
    } else {
        None
    }
}

/// Classify a driver error
fn map_pg_error(err: tokio_postgres::Error, sql: &str) -> Error {
    if err.is_closed() {
        return Error::connection_with_source("connection closed", err);
    }

    let message = match err.as_db_error() {
        Some(db) => {
            if let Some(e) = classify_db_error(db.code(), db.message(), db.constraint(), sql) {
                return e;
            }
            db.message().to_string()
        }
        None => err.to_string(),
    };

    Error::Query {
        message,
        sql: Some(sql.to_string()),
        source: Some(Box::new(err)),
    }
}

fn map_tx_error(err: tokio_postgres::Error) -> Error {
    if err.is_closed() {
        return Error::connection_with_source("connection closed", err);
    }
    Error::Transaction {
        message: err.to_string(),
        source: Some(Box::new(err)),
    }
}

/// Session state shared by a connection and its transactions
struct Session {
    client: Client,
    statements: Mutex<HashMap<String, Statement>>,
    /// Set when the wire state can no longer be trusted
    lost: AtomicBool,
}

impl Session {
    async fn statement(&self, sql: &str) -> Result<Statement> {
        let mut cache = self.statements.lock().await;
        if let Some(stmt) = cache.get(sql) {
            return Ok(stmt.clone());
        }

        let stmt = self
            .client
            .prepare(sql)
            .await
            .map_err(|e| map_pg_error(e, sql))?;

        if cache.len() >= STATEMENT_CACHE_CAPACITY {
            debug!("Resetting statement cache ({} entries)", cache.len());
            cache.clear();
        }
        cache.insert(sql.to_string(), stmt.clone());
        Ok(stmt)
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        if params.is_empty() {
            return self
                .client
                .execute(sql, &[])
                .await
                .map_err(|e| map_pg_error(e, sql));
        }

        let stmt = self.statement(sql).await?;
        let bound: Vec<PgParam<'_>> = params.iter().map(PgParam).collect();
        let param_refs: Vec<&(dyn ToSql + Sync)> =
            bound.iter().map(|p| p as &(dyn ToSql + Sync)).collect();

        self.client
            .execute(&stmt, &param_refs)
            .await
            .map_err(|e| map_pg_error(e, sql))
    }
}

/// PostgreSQL connection implementation
pub struct PgConnection {
    session: Arc<Session>,
    closed: AtomicBool,
}

impl PgConnection {
    /// Create a new connection from a tokio-postgres client
    pub fn new(client: Client) -> Self {
        Self {
            session: Arc::new(Session {
                client,
                statements: Mutex::new(HashMap::new()),
                lost: AtomicBool::new(false),
            }),
            closed: AtomicBool::new(false),
        }
    }

    /// Get the underlying client
    pub fn client(&self) -> &Client {
        &self.session.client
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed)
            || self.session.lost.load(Ordering::Relaxed)
            || self.session.client.is_closed()
        {
            return Err(Error::connection("connection is closed"));
        }
        Ok(())
    }
}

impl std::fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConnection")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.ensure_open()?;
        self.session.execute(sql, params).await
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.ensure_open()?;

        self.session
            .client
            .batch_execute("BEGIN")
            .await
            .map_err(map_tx_error)?;

        Ok(Box::new(PgTransaction {
            session: Arc::clone(&self.session),
            finished: AtomicBool::new(false),
        }))
    }

    async fn is_valid(&self) -> bool {
        if self.ensure_open().is_err() {
            return false;
        }
        self.session.client.simple_query("SELECT 1").await.is_ok()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// PostgreSQL transaction
pub struct PgTransaction {
    session: Arc<Session>,
    finished: AtomicBool,
}

impl PgTransaction {
    async fn copy(&self, sql: &str, data: Bytes) -> Result<u64> {
        let sink = self
            .session
            .client
            .copy_in::<_, Bytes>(sql)
            .await
            .map_err(|e| map_pg_error(e, sql))?;
        futures::pin_mut!(sink);

        sink.as_mut()
            .send(data)
            .await
            .map_err(|e| map_pg_error(e, sql))?;
        sink.as_mut().finish().await.map_err(|e| map_pg_error(e, sql))
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.session.execute(sql, params).await
    }

    async fn copy_in(&self, sql: &str, data: Bytes) -> Result<u64> {
        let result = self.copy(sql, data).await;
        if result.is_err() {
            // an aborted COPY can leave the protocol mid-stream; the session
            // must not be handed out again
            self.session.lost.store(true, Ordering::Relaxed);
        }
        result
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.session
            .client
            .batch_execute("COMMIT")
            .await
            .map_err(map_tx_error)?;
        self.finished.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.session
            .client
            .batch_execute("ROLLBACK")
            .await
            .map_err(map_tx_error)?;
        self.finished.store(true, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        if !self.finished.load(Ordering::Relaxed) && !self.session.client.is_closed() {
            warn!("Transaction dropped without COMMIT or ROLLBACK; session left in transaction");
        }
    }
}

/// PostgreSQL connection factory
#[derive(Debug, Clone, Default)]
pub struct PgConnectionFactory;

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let mut pg_config = tokio_postgres::Config::from_str(&config.url)
            .map_err(|e| Error::config(format!("invalid database url: {}", e)))?;
        pg_config.connect_timeout(config.connect_timeout);
        if let Some(name) = &config.application_name {
            pg_config.application_name(name);
        }

        let (client, connection) = tokio::time::timeout(
            config.connect_timeout,
            pg_config.connect(tokio_postgres::NoTls),
        )
        .await
        .map_err(|_| {
            Error::timeout(format!(
                "connecting to database timed out after {:?}",
                config.connect_timeout
            ))
        })?
        .map_err(|e| Error::connection_with_source("failed to connect", e))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("PostgreSQL connection error: {}", e);
            }
        });

        debug!("Connected to PostgreSQL");
        Ok(Box::new(PgConnection::new(client)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn bind(value: Value, ty: &Type) -> std::result::Result<IsNull, String> {
        let mut buf = BytesMut::new();
        PgParam(&value)
            .to_sql(ty, &mut buf)
            .map_err(|e| e.to_string())
    }

    #[test]
    fn test_null_binds_to_any_type() {
        assert!(matches!(bind(Value::Null, &Type::INT4), Ok(IsNull::Yes)));
        assert!(matches!(bind(Value::Null, &Type::POINT), Ok(IsNull::Yes)));
    }

    #[test]
    fn test_numeric_coercions() {
        assert!(bind(Value::Int64(7), &Type::INT4).is_ok());
        assert!(bind(Value::Int64(i64::MAX), &Type::INT4).is_err());
        assert!(bind(Value::Float64(2.0), &Type::INT8).is_ok());
        assert!(bind(Value::Float64(2.5), &Type::INT8).is_err());
        assert!(bind(Value::Int64(3), &Type::FLOAT8).is_ok());
        assert!(bind(Value::Float64(1.25), &Type::NUMERIC).is_ok());
    }

    #[test]
    fn test_timestamp_binding() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(bind(Value::Timestamp(ts), &Type::TIMESTAMPTZ).is_ok());
        assert!(bind(Value::Timestamp(ts), &Type::TIMESTAMP).is_ok());
        assert!(bind(Value::from("2024-01-01T00:00:00Z"), &Type::TIMESTAMPTZ).is_ok());
        assert!(bind(Value::Bool(true), &Type::TIMESTAMPTZ).is_err());
    }

    #[test]
    fn test_unsupported_type_is_reported() {
        let err = bind(Value::from("x"), &Type::POINT).err().unwrap();
        assert!(err.contains("TEXT"));
        assert!(err.contains("point"));
    }

    #[test]
    fn test_cardinality_violation_needs_conflict_message() {
        let sql = "INSERT INTO roomtemp ...";
        let conflict = classify_db_error(
            &SqlState::CARDINALITY_VIOLATION,
            "ON CONFLICT DO UPDATE command cannot affect row a second time",
            None,
            sql,
        );
        assert!(conflict.is_some_and(|e| e.is_batch_conflict()));

        // a scalar subquery returning two rows is the same SQLSTATE
        let subquery = classify_db_error(
            &SqlState::CARDINALITY_VIOLATION,
            "more than one row returned by a subquery used as an expression",
            None,
            sql,
        );
        assert!(subquery.is_none());

        let other = classify_db_error(
            &SqlState::UNDEFINED_TABLE,
            "cannot affect row a second time",
            None,
            sql,
        );
        assert!(other.is_none());
    }

    #[test]
    fn test_unique_violation_is_a_constraint_error() {
        let err = classify_db_error(
            &SqlState::UNIQUE_VIOLATION,
            "duplicate key value violates unique constraint \"doors_pkey\"",
            Some("doors_pkey"),
            "COPY \"doors\" FROM STDIN",
        );
        match err {
            Some(Error::Constraint {
                constraint_name, ..
            }) => assert_eq!(constraint_name, "doors_pkey"),
            other => panic!("unexpected classification: {other:?}"),
        }
    }
}
