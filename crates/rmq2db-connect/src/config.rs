//! Configuration types for rmq2db-connect
//!
//! Layout:
//!   database  → where rows are written
//!   broker    → which queue is consumed
//!   flush     → count / time triggers
//!   handlers  → logical key → table, key fields, value fields, strategy

use anyhow::{anyhow, bail};
use rmq2db_rdbc::sink::{SinkTarget, WriteStrategy, DEFAULT_PAGE_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use validator::Validate;

use crate::flush::FlushSettings;
use crate::types::SensitiveString;

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct BridgeConfig {
    /// Target database
    #[validate(nested)]
    pub database: DatabaseConfig,

    /// Source broker and queue
    #[validate(nested)]
    pub broker: BrokerConfig,

    /// Flush triggers
    #[serde(default)]
    #[validate(nested)]
    pub flush: FlushConfig,

    /// Prometheus exporter
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// One handler per logical key, flushed in this order
    #[validate(length(min = 1), nested)]
    pub handlers: Vec<HandlerConfig>,
}

/// Database connection configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct DatabaseConfig {
    /// PostgreSQL connection string
    pub url: SensitiveString,

    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    #[validate(range(min = 1, max = 300))]
    pub connect_timeout_secs: u64,
}

impl DatabaseConfig {
    /// Connect timeout as a duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn default_connect_timeout_secs() -> u64 {
    10
}

/// Broker connection configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct BrokerConfig {
    /// AMQP URI
    pub url: SensitiveString,

    /// Queue to consume (must already exist and be bound)
    #[validate(length(min = 1, max = 255))]
    pub queue: String,

    /// Consumer tag shown in the broker's management UI
    #[serde(default = "default_consumer_tag")]
    #[validate(length(min = 1, max = 255))]
    pub consumer_tag: String,

    /// Header carrying a millisecond timestamp
    #[serde(default = "default_timestamp_header")]
    #[validate(length(min = 1, max = 255))]
    pub timestamp_header: String,
}

fn default_consumer_tag() -> String {
    "rmq2db".to_string()
}

fn default_timestamp_header() -> String {
    "timestamp_in_ms".to_string()
}

/// Flush triggers
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct FlushConfig {
    /// Pending rows that trigger a flush; also the broker prefetch limit
    #[serde(default = "default_flush_count")]
    #[validate(range(min = 1, max = 65535))]
    pub count: usize,

    /// Longest wait before a flush, in seconds
    #[serde(default = "default_flush_time_secs")]
    pub time_secs: f64,

    /// Pause after a failed flush, in seconds (defaults to `time_secs`)
    #[serde(default)]
    pub retry_backoff_secs: Option<f64>,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            count: default_flush_count(),
            time_secs: default_flush_time_secs(),
            retry_backoff_secs: None,
        }
    }
}

impl FlushConfig {
    /// Runtime flush settings
    pub fn settings(&self) -> FlushSettings {
        let max_wait = Duration::try_from_secs_f64(self.time_secs)
            .unwrap_or(Duration::from_secs(5));
        let retry_backoff = self
            .retry_backoff_secs
            .and_then(|s| Duration::try_from_secs_f64(s).ok())
            .unwrap_or(max_wait);
        FlushSettings {
            count: self.count,
            max_wait,
            retry_backoff,
        }
    }

    /// Broker prefetch limit, equal to the count threshold
    pub fn prefetch(&self) -> u16 {
        u16::try_from(self.count).unwrap_or(u16::MAX)
    }
}

fn default_flush_count() -> usize {
    100
}

fn default_flush_time_secs() -> f64 {
    5.0
}

/// Prometheus exporter configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Whether to serve `/metrics`
    #[serde(default)]
    pub enabled: bool,

    /// Listen address
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9090))
}

/// One logical key and its target table
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct HandlerConfig {
    /// Logical key from the routing key (defaults to the table name)
    #[serde(default)]
    pub key: Option<String>,

    /// Target schema
    #[serde(default)]
    pub schema: Option<String>,

    /// Target table
    #[validate(length(min = 1, max = 63))]
    pub table: String,

    /// Conflict key fields, in column order
    #[serde(default)]
    pub key_fields: Vec<String>,

    /// Value fields, in column order after the keys
    #[serde(default)]
    pub value_fields: Vec<String>,

    /// Write strategy
    #[serde(default)]
    pub strategy: WriteStrategy,

    /// Rows per statement for `paged_upsert`
    #[serde(default = "default_page_size")]
    #[validate(range(min = 1))]
    pub page_size: usize,
}

impl HandlerConfig {
    /// The logical key this handler answers to
    pub fn logical_key(&self) -> &str {
        self.key.as_deref().unwrap_or(&self.table)
    }

    /// Target description for the sink
    pub fn target(&self) -> SinkTarget {
        let target = SinkTarget::new(
            self.table.clone(),
            self.key_fields.clone(),
            self.value_fields.clone(),
        );
        match &self.schema {
            Some(schema) => target.with_schema(schema.clone()),
            None => target,
        }
    }
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

impl BridgeConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read config file: {}", e))?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let expanded = Self::expand_env_vars(content);

        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| anyhow!("Failed to parse config: {}", e))?;

        config.validate()?;
        Ok(config)
    }

    /// Expand environment variables in the format ${VAR} or ${VAR:-default}
    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures<'_>| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        Validate::validate(self).map_err(|e| anyhow!("Invalid configuration: {}", e))?;

        if !(self.flush.time_secs.is_finite() && self.flush.time_secs > 0.0) {
            bail!("flush.time_secs must be a positive number of seconds");
        }
        if let Some(backoff) = self.flush.retry_backoff_secs {
            if !(backoff.is_finite() && backoff >= 0.0) {
                bail!("flush.retry_backoff_secs must not be negative");
            }
        }

        let mut keys = HashSet::new();
        let mut staging_tables = HashSet::new();
        for handler in &self.handlers {
            let key = handler.logical_key();
            if key.is_empty() || key.contains('.') {
                bail!("Handler key '{}' must be non-empty and contain no '.'", key);
            }
            if !keys.insert(key) {
                bail!("Handler key '{}' is declared more than once", key);
            }

            self.validate_fields(handler)?;

            if handler.strategy.is_upsert() && handler.key_fields.is_empty() {
                bail!(
                    "Handler '{}': strategy '{}' needs at least one key field",
                    key,
                    handler.strategy
                );
            }

            let target = handler.target();
            target
                .validate()
                .map_err(|e| anyhow!("Handler '{}': {}", key, e))?;

            if handler.strategy == WriteStrategy::BulkMerge
                && !staging_tables.insert(target.staging_table())
            {
                bail!(
                    "Handler '{}': staging table '{}' is shared with another handler",
                    key,
                    target.staging_table()
                );
            }
        }

        Ok(())
    }

    fn validate_fields(&self, handler: &HandlerConfig) -> anyhow::Result<()> {
        let key = handler.logical_key();
        if handler.key_fields.is_empty() && handler.value_fields.is_empty() {
            bail!("Handler '{}' declares no fields", key);
        }

        let mut seen = HashSet::new();
        for field in handler.key_fields.iter().chain(&handler.value_fields) {
            if field.is_empty() {
                bail!("Handler '{}' declares an empty field name", key);
            }
            if !seen.insert(field.as_str()) {
                if handler.key_fields.contains(field) && handler.value_fields.contains(field) {
                    bail!(
                        "Handler '{}': field '{}' is both a key field and a value field",
                        key,
                        field
                    );
                }
                bail!("Handler '{}': field '{}' is declared twice", key, field);
            }
        }
        Ok(())
    }
}
