//! rmq2db-connect - Buffering RabbitMQ to PostgreSQL bridge
//!
//! Messages arrive on one queue with routing keys of the form
//! `<prefix>.<logical-key>.<encoding>`. Each logical key has a handler that
//! buffers decoded rows for one table. A background loop flushes all
//! buffers in one transaction when enough rows are pending or when the
//! maximum wait elapses, then acknowledges the broker cumulatively.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────┐   ┌──────────────────┐   ┌─────────────────────┐
//! │ RabbitMQ │──▶│ Decoder │──▶│ FlushCoordinator │──▶│ TransactionalWriter │──▶ PostgreSQL
//! │ (lapin)  │   │ Registry│   │ buffers, counter │   │ sink strategies     │
//! └──────────┘   └─────────┘   └──────────────────┘   └─────────────────────┘
//!       ▲                               │
//!       └──── cumulative ack ◀──────────┘
//! ```
//!
//! # CLI Usage (Binary)
//!
//! ```bash
//! # Run the bridge
//! rmq2db -c rmq2db.yaml
//!
//! # Validate configuration
//! rmq2db -c rmq2db.yaml validate
//! ```

// Common types (SensitiveString)
pub mod types;

// Error types
pub mod error;

// Configuration
pub mod config;

// Core
pub mod broker;
pub mod buffer;
pub mod decoder;
pub mod flush;
pub mod handler;

// Runtime
pub mod amqp;
pub mod bridge;

pub use bridge::Bridge;
pub use broker::{Acknowledger, InboundMessage};
pub use buffer::{FlushCoordinator, FlushOutcome};
pub use config::BridgeConfig;
pub use decoder::Decoder;
pub use error::{BridgeError, Result};
pub use flush::{FlushSettings, TransactionalWriter};
pub use handler::{FieldMap, Handler, HandlerDescriptor, HandlerRegistry};
pub use types::SensitiveString;
