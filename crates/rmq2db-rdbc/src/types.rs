//! Value types for rmq2db-rdbc
//!
//! The value model is deliberately small: everything a decoded JSON message can
//! carry, plus the UTC timestamp the router injects for time-keyed tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// SQL value decoded from a message field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Boolean value
    Bool(bool),
    /// 64-bit signed integer
    Int64(i64),
    /// 64-bit floating point
    Float64(f64),
    /// Text string
    String(String),
    /// Nested JSON (arrays and objects)
    Json(serde_json::Value),
    /// Timestamp with timezone, normalized to UTC
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// Check if value is NULL
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get SQL type name
    pub fn sql_type(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Bool(_) => "BOOLEAN",
            Self::Int64(_) => "BIGINT",
            Self::Float64(_) => "DOUBLE PRECISION",
            Self::String(_) => "TEXT",
            Self::Json(_) => "JSONB",
            Self::Timestamp(_) => "TIMESTAMPTZ",
        }
    }

    /// Try to convert to bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int64(n) => Some(*n != 0),
            Self::String(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1" => Some(true),
                "false" | "f" | "no" | "n" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Try to convert to i64 (floats only when they carry no fraction)
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int64(n) => Some(*n),
            Self::Float64(n) if n.is_finite() && n.fract() == 0.0 => Some(*n as i64),
            Self::Bool(b) => Some(i64::from(*b)),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Try to convert to f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int64(n) => Some(*n as f64),
            Self::Float64(n) => Some(*n),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Try to borrow as string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Try to convert to a UTC timestamp
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(ts) => Some(*ts),
            Self::String(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|ts| ts.with_timezone(&Utc)),
            _ => None,
        }
    }

    /// Convert to a JSON value
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int64(n) => serde_json::Value::from(*n),
            Self::Float64(n) => serde_json::Value::from(*n),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Json(j) => j.clone(),
            Self::Timestamp(ts) => serde_json::Value::String(ts.to_rfc3339()),
        }
    }

    /// Text representation used for text-typed columns (None for NULL)
    pub fn to_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Bool(b) => Some(b.to_string()),
            Self::Int64(n) => Some(n.to_string()),
            Self::Float64(n) => Some(n.to_string()),
            Self::String(s) => Some(s.clone()),
            Self::Json(j) => Some(j.to_string()),
            Self::Timestamp(ts) => Some(ts.to_rfc3339()),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int64(i),
                None => n.as_f64().map_or(Self::Null, Self::Float64),
            },
            serde_json::Value::String(s) => Self::String(s),
            other @ (serde_json::Value::Array(_) | serde_json::Value::Object(_)) => {
                Self::Json(other)
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int64(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Timestamp(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// One buffered row: values in declared column order (key fields, then value fields)
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    /// Create a row from ordered values
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// Values in column order
    #[inline]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Number of values
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the row has no values
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Get a value by column index
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }
}

impl From<Vec<Value>> for Row {
    fn from(values: Vec<Value>) -> Self {
        Self::new(values)
    }
}
