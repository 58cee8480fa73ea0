//! Table sinks for buffered batches
//!
//! Provides:
//! - SinkTarget: target table plus ordered key and value columns
//! - SinkStrategy: one batch write inside a caller-owned transaction
//! - BulkMergeSink: COPY into a staging table, then merge with ON CONFLICT
//! - CopySink: COPY straight into the target (append-only)
//! - PagedUpsertSink: multi-row parameterized upserts in bounded pages
//!
//! No strategy commits or rolls back; the caller owns the transaction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

use crate::connection::Transaction;
use crate::copy::encode_rows;
use crate::dialect::PostgresDialect;
use crate::error::{Error, Result};
use crate::security::validate_identifier;
use crate::types::{Row, Value};

/// Prefix of the per-table staging table used by [`BulkMergeSink`]
pub const STAGING_PREFIX: &str = "temp_";

/// Default number of rows per upsert statement
pub const DEFAULT_PAGE_SIZE: usize = 500;

/// Write strategy selected per handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStrategy {
    /// COPY into a staging table, then INSERT ... SELECT ... ON CONFLICT
    #[default]
    BulkMerge,
    /// COPY directly into the target table
    Copy,
    /// Multi-row INSERT ... VALUES ... ON CONFLICT in pages
    PagedUpsert,
}

impl WriteStrategy {
    /// Whether this strategy resolves key conflicts (and so needs key columns)
    pub const fn is_upsert(self) -> bool {
        matches!(self, Self::BulkMerge | Self::PagedUpsert)
    }
}

impl fmt::Display for WriteStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BulkMerge => write!(f, "bulk_merge"),
            Self::Copy => write!(f, "copy"),
            Self::PagedUpsert => write!(f, "paged_upsert"),
        }
    }
}

/// Target table description shared by all strategies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkTarget {
    /// Optional schema
    pub schema: Option<String>,
    /// Target table
    pub table: String,
    /// Conflict key columns, in row order
    pub key_columns: Vec<String>,
    /// Updated columns, in row order after the keys
    pub value_columns: Vec<String>,
}

impl SinkTarget {
    /// Create a target in the default schema
    pub fn new(
        table: impl Into<String>,
        key_columns: Vec<String>,
        value_columns: Vec<String>,
    ) -> Self {
        Self {
            schema: None,
            table: table.into(),
            key_columns,
            value_columns,
        }
    }

    /// Set the schema
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Check identifiers and column lists
    pub fn validate(&self) -> Result<()> {
        if let Some(schema) = &self.schema {
            validate_identifier(schema)?;
        }
        validate_identifier(&self.table)?;

        if self.column_count() == 0 {
            return Err(Error::config(format!(
                "table '{}' declares no columns",
                self.table
            )));
        }

        let mut seen = HashSet::new();
        for column in self.columns() {
            validate_identifier(column)?;
            if !seen.insert(column) {
                return Err(Error::config(format!(
                    "column '{}' declared more than once for table '{}'",
                    column, self.table
                )));
            }
        }
        Ok(())
    }

    /// All columns: keys first, then values
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.key_columns
            .iter()
            .chain(&self.value_columns)
            .map(String::as_str)
    }

    /// Number of columns per row
    pub fn column_count(&self) -> usize {
        self.key_columns.len() + self.value_columns.len()
    }

    /// Quoted, optionally schema-qualified table reference
    pub fn table_ref(&self) -> String {
        PostgresDialect.qualified_table(self.schema.as_deref(), &self.table)
    }

    /// Name of the session-scoped staging table
    pub fn staging_table(&self) -> String {
        format!("{}{}", STAGING_PREFIX, self.table)
    }

    fn column_names(&self) -> Vec<&str> {
        self.columns().collect()
    }

    fn check_rows(&self, rows: &[Row]) -> Result<()> {
        let width = self.column_count();
        match rows.iter().position(|r| r.len() != width) {
            Some(i) => Err(Error::type_conversion(format!(
                "row {} for table '{}' has {} values, expected {}",
                i,
                self.table,
                rows[i].len(),
                width
            ))),
            None => Ok(()),
        }
    }
}

/// A batch write against an open transaction
#[async_trait]
pub trait SinkStrategy: Send + Sync + fmt::Debug {
    /// Strategy name for logs
    fn name(&self) -> &'static str;

    /// The table written to
    fn target(&self) -> &SinkTarget;

    /// Write `rows` in order. With `row_by_row`, each row goes out in its own
    /// statement so that repeated keys are applied one after another.
    /// Returns the number of rows written.
    async fn write(&self, tx: &dyn Transaction, rows: &[Row], row_by_row: bool) -> Result<u64>;
}

/// Stream rows into a staging table, then merge into the target.
///
/// COPY cannot resolve conflicts itself, so the transport and the conflict
/// handling are split: `CREATE TEMP TABLE IF NOT EXISTS`, `COPY` into it,
/// `INSERT ... SELECT ... ON CONFLICT DO UPDATE`, `TRUNCATE` for the next use.
#[derive(Debug, Clone)]
pub struct BulkMergeSink {
    target: SinkTarget,
    staging: String,
    create_sql: String,
    copy_sql: String,
    merge_sql: String,
    truncate_sql: String,
}

impl BulkMergeSink {
    /// Build the statements for `target`
    pub fn new(target: SinkTarget) -> Result<Self> {
        target.validate()?;
        if target.key_columns.is_empty() {
            return Err(Error::config(format!(
                "bulk merge into '{}' needs at least one key column",
                target.table
            )));
        }

        let staging = target.staging_table();
        validate_identifier(&staging)?;

        let dialect = PostgresDialect;
        let table_ref = target.table_ref();
        let copy_sql = dialect.copy_from_stdin_sql(
            &dialect.quote_identifier(&staging),
            &target.column_names(),
        );
        let merge_sql = dialect.merge_from_staging_sql(
            &table_ref,
            &staging,
            &target.key_columns,
            &target.value_columns,
        );

        Ok(Self {
            create_sql: dialect.create_staging_sql(&staging, &table_ref),
            copy_sql,
            merge_sql,
            truncate_sql: dialect.truncate_sql(&staging),
            staging,
            target,
        })
    }

    /// Staging table name
    pub fn staging(&self) -> &str {
        &self.staging
    }

    async fn merge(&self, tx: &dyn Transaction, rows: &[Row]) -> Result<u64> {
        tx.copy_in(&self.copy_sql, encode_rows(rows)).await?;
        let merged = tx.execute(&self.merge_sql, &[]).await?;
        tx.execute(&self.truncate_sql, &[]).await?;
        Ok(merged)
    }
}

#[async_trait]
impl SinkStrategy for BulkMergeSink {
    fn name(&self) -> &'static str {
        "bulk_merge"
    }

    fn target(&self) -> &SinkTarget {
        &self.target
    }

    async fn write(&self, tx: &dyn Transaction, rows: &[Row], row_by_row: bool) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        self.target.check_rows(rows)?;

        tx.execute(&self.create_sql, &[]).await?;

        if row_by_row {
            for row in rows {
                self.merge(tx, std::slice::from_ref(row)).await?;
            }
        } else {
            self.merge(tx, rows).await?;
        }

        trace!(table = %self.target.table, rows = rows.len(), "merged via {}", self.staging);
        Ok(rows.len() as u64)
    }
}

/// Stream rows straight into the target table.
///
/// Append-only: there is no conflict handling, so the row-by-row flag has
/// nothing to resolve and the batch always goes out as one COPY.
#[derive(Debug, Clone)]
pub struct CopySink {
    target: SinkTarget,
    copy_sql: String,
}

impl CopySink {
    /// Build the COPY statement for `target`
    pub fn new(target: SinkTarget) -> Result<Self> {
        target.validate()?;
        let copy_sql =
            PostgresDialect.copy_from_stdin_sql(&target.table_ref(), &target.column_names());
        Ok(Self { target, copy_sql })
    }
}

#[async_trait]
impl SinkStrategy for CopySink {
    fn name(&self) -> &'static str {
        "copy"
    }

    fn target(&self) -> &SinkTarget {
        &self.target
    }

    async fn write(&self, tx: &dyn Transaction, rows: &[Row], _row_by_row: bool) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        self.target.check_rows(rows)?;
        tx.copy_in(&self.copy_sql, encode_rows(rows)).await
    }
}

/// Multi-row parameterized upserts, `page_size` rows per statement
#[derive(Debug, Clone)]
pub struct PagedUpsertSink {
    target: SinkTarget,
    page_size: usize,
}

impl PagedUpsertSink {
    /// Create with a page size, capped to the bind-parameter limit
    pub fn new(target: SinkTarget, page_size: usize) -> Result<Self> {
        target.validate()?;
        if target.key_columns.is_empty() {
            return Err(Error::config(format!(
                "upsert into '{}' needs at least one key column",
                target.table
            )));
        }
        if page_size == 0 {
            return Err(Error::config("page size must be at least 1"));
        }

        let cap = PostgresDialect.max_rows_per_statement(target.column_count());
        Ok(Self {
            page_size: page_size.min(cap),
            target,
        })
    }

    /// Effective rows per statement
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    fn statement(&self, rows: usize) -> String {
        PostgresDialect.upsert_sql(
            self.target.schema.as_deref(),
            &self.target.table,
            &self.target.key_columns,
            &self.target.value_columns,
            rows,
        )
    }
}

#[async_trait]
impl SinkStrategy for PagedUpsertSink {
    fn name(&self) -> &'static str {
        "paged_upsert"
    }

    fn target(&self) -> &SinkTarget {
        &self.target
    }

    async fn write(&self, tx: &dyn Transaction, rows: &[Row], row_by_row: bool) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        self.target.check_rows(rows)?;

        let page_size = if row_by_row { 1 } else { self.page_size };
        let full_page = page_size.min(rows.len());
        let full_page_sql = self.statement(full_page);

        for page in rows.chunks(page_size) {
            let params: Vec<Value> = page
                .iter()
                .flat_map(|row| row.values().iter().cloned())
                .collect();

            let tail_sql;
            let sql = if page.len() == full_page {
                &full_page_sql
            } else {
                tail_sql = self.statement(page.len());
                &tail_sql
            };
            tx.execute(sql, &params).await?;
        }

        Ok(rows.len() as u64)
    }
}

/// Build the strategy for `target`
pub fn build_sink(
    strategy: WriteStrategy,
    target: SinkTarget,
    page_size: usize,
) -> Result<Arc<dyn SinkStrategy>> {
    Ok(match strategy {
        WriteStrategy::BulkMerge => Arc::new(BulkMergeSink::new(target)?),
        WriteStrategy::Copy => Arc::new(CopySink::new(target)?),
        WriteStrategy::PagedUpsert => Arc::new(PagedUpsertSink::new(target, page_size)?),
    })
}
