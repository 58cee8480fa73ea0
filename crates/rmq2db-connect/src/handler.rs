//! Handlers and the handler registry.
//!
//! A [`HandlerDescriptor`] is the immutable part of a handler: logical key,
//! declared field order and the sink strategy. A [`Handler`] pairs a
//! descriptor with its buffer of pending rows. The [`HandlerRegistry`] is
//! built once at startup and maps logical keys to descriptors; the flush
//! coordinator owns the buffers.

use rmq2db_rdbc::connection::Transaction;
use rmq2db_rdbc::sink::{build_sink, SinkStrategy};
use rmq2db_rdbc::types::{Row, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::HandlerConfig;
use crate::error::{BridgeError, Result};

/// Decoded message fields by name
pub type FieldMap = HashMap<String, Value>;

/// Field that carries the event time
pub const TIME_FIELD: &str = "time";

/// Immutable handler definition
#[derive(Debug)]
pub struct HandlerDescriptor {
    key: String,
    fields: Vec<String>,
    needs_time: bool,
    sink: Arc<dyn SinkStrategy>,
}

impl HandlerDescriptor {
    /// Create a descriptor; the field order is the sink's key columns, then its value columns
    pub fn new(key: impl Into<String>, sink: Arc<dyn SinkStrategy>) -> Self {
        let fields: Vec<String> = sink.target().columns().map(str::to_string).collect();
        let needs_time = fields.iter().any(|f| f == TIME_FIELD);
        Self {
            key: key.into(),
            fields,
            needs_time,
            sink,
        }
    }

    /// Build a descriptor from configuration
    pub fn from_config(config: &HandlerConfig) -> Result<Self> {
        let sink = build_sink(config.strategy, config.target(), config.page_size).map_err(|e| {
            BridgeError::Config(format!("handler '{}': {}", config.logical_key(), e))
        })?;
        Ok(Self::new(config.logical_key(), sink))
    }

    /// Logical key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Declared fields: key fields, then value fields
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Whether "time" is among the declared fields
    pub fn needs_time(&self) -> bool {
        self.needs_time
    }

    /// Target table name
    pub fn table(&self) -> &str {
        &self.sink.target().table
    }

    /// Project a field map onto the declared field order
    pub fn project(&self, fields: &FieldMap) -> Result<Row> {
        let values = self
            .fields
            .iter()
            .map(|name| {
                fields
                    .get(name)
                    .cloned()
                    .ok_or_else(|| BridgeError::MissingField {
                        key: self.key.clone(),
                        field: name.clone(),
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Row::new(values))
    }
}

/// A descriptor plus its pending rows
#[derive(Debug)]
pub struct Handler {
    descriptor: Arc<HandlerDescriptor>,
    buffer: Vec<Row>,
}

impl Handler {
    /// Create a handler with an empty buffer
    pub fn new(descriptor: Arc<HandlerDescriptor>) -> Self {
        Self {
            descriptor,
            buffer: Vec::new(),
        }
    }

    /// The descriptor
    pub fn descriptor(&self) -> &HandlerDescriptor {
        &self.descriptor
    }

    /// Project `fields` and append the row. Nothing is appended on error.
    pub fn append(&mut self, fields: &FieldMap) -> Result<()> {
        let row = self.descriptor.project(fields)?;
        self.buffer.push(row);
        Ok(())
    }

    /// Write the buffer through the sink inside `tx`.
    ///
    /// The buffer is left untouched; it is cleared by the coordinator once
    /// the whole flush has committed.
    pub async fn flush_to(&self, tx: &dyn Transaction, row_by_row: bool) -> rmq2db_rdbc::Result<u64> {
        self.descriptor
            .sink
            .write(tx, &self.buffer, row_by_row)
            .await
    }

    /// Buffered rows in arrival order
    pub fn rows(&self) -> &[Row] {
        &self.buffer
    }

    /// Number of buffered rows
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Move the buffered rows into a detached handler, leaving this one empty
    pub fn take_batch(&mut self) -> Handler {
        Handler {
            descriptor: Arc::clone(&self.descriptor),
            buffer: std::mem::take(&mut self.buffer),
        }
    }

    /// Put a batch back in front of rows that arrived after it was taken
    pub fn restore(&mut self, batch: Handler) {
        let mut rows = batch.buffer;
        rows.append(&mut self.buffer);
        self.buffer = rows;
    }
}

/// Logical key → handler, fixed after startup
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    descriptors: Vec<Arc<HandlerDescriptor>>,
    by_key: HashMap<String, usize>,
}

impl HandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from handler configuration, in declaration order
    pub fn from_config(handlers: &[HandlerConfig]) -> Result<Self> {
        let mut registry = Self::new();
        for config in handlers {
            registry.register(HandlerDescriptor::from_config(config)?)?;
        }
        Ok(registry)
    }

    /// Add a handler; returns its index (flush order)
    pub fn register(&mut self, descriptor: HandlerDescriptor) -> Result<usize> {
        if self.by_key.contains_key(descriptor.key()) {
            return Err(BridgeError::Config(format!(
                "handler key '{}' registered twice",
                descriptor.key()
            )));
        }
        let index = self.descriptors.len();
        self.by_key.insert(descriptor.key().to_string(), index);
        self.descriptors.push(Arc::new(descriptor));
        Ok(index)
    }

    /// Find the handler for a logical key
    pub fn lookup(&self, key: &str) -> Option<(usize, &Arc<HandlerDescriptor>)> {
        self.by_key
            .get(key)
            .map(|&index| (index, &self.descriptors[index]))
    }

    /// Fresh handlers with empty buffers, in registration order
    pub fn handlers(&self) -> Vec<Handler> {
        self.descriptors
            .iter()
            .map(|d| Handler::new(Arc::clone(d)))
            .collect()
    }

    /// Number of handlers
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Whether no handler is registered
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
