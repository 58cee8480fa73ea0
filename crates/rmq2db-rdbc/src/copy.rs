//! COPY text-format encoding.
//!
//! Rows are rendered into one buffer in PostgreSQL's `COPY ... FROM STDIN`
//! text format and shipped in a single CopyData stream, so a batch costs one
//! round trip regardless of its size. The server parses every field with the
//! target column's input function, which is why no client-side type
//! information is needed here.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt::Write as _;

use crate::types::{Row, Value};

const NULL_MARKER: &[u8] = b"\\N";

/// Accumulates rows in COPY text format
#[derive(Debug, Default)]
pub struct CopyEncoder {
    buf: BytesMut,
    rows: usize,
}

impl CopyEncoder {
    /// Create an empty encoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an encoder with pre-allocated capacity (bytes)
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            rows: 0,
        }
    }

    /// Append one row
    pub fn write_row(&mut self, row: &Row) {
        for (i, value) in row.values().iter().enumerate() {
            if i > 0 {
                self.buf.put_u8(b'\t');
            }
            write_value(&mut self.buf, value);
        }
        self.buf.put_u8(b'\n');
        self.rows += 1;
    }

    /// Append many rows
    pub fn write_rows<'a>(&mut self, rows: impl IntoIterator<Item = &'a Row>) {
        for row in rows {
            self.write_row(row);
        }
    }

    /// Number of rows written so far
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Finish and hand out the encoded payload
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Encode a slice of rows in one go
pub fn encode_rows(rows: &[Row]) -> Bytes {
    let mut encoder = CopyEncoder::with_capacity(rows.len() * 32);
    encoder.write_rows(rows);
    encoder.finish()
}

fn write_value(buf: &mut BytesMut, value: &Value) {
    match value {
        Value::Null => buf.put_slice(NULL_MARKER),
        Value::Bool(b) => buf.put_u8(if *b { b't' } else { b'f' }),
        Value::Int64(n) => {
            let _ = write!(buf, "{}", n);
        }
        Value::Float64(n) => write_float(buf, *n),
        Value::String(s) => write_escaped(buf, s),
        Value::Json(j) => write_escaped(buf, &j.to_string()),
        Value::Timestamp(ts) => {
            let _ = write!(buf, "{}", ts.format("%Y-%m-%d %H:%M:%S%.6f+00"));
        }
    }
}

fn write_float(buf: &mut BytesMut, n: f64) {
    if n.is_nan() {
        buf.put_slice(b"NaN");
    } else if n.is_infinite() {
        buf.put_slice(if n > 0.0 { b"Infinity" } else { b"-Infinity" });
    } else {
        let _ = write!(buf, "{}", n);
    }
}

fn write_escaped(buf: &mut BytesMut, s: &str) {
    for &byte in s.as_bytes() {
        match byte {
            b'\\' => buf.put_slice(b"\\\\"),
            b'\n' => buf.put_slice(b"\\n"),
            b'\r' => buf.put_slice(b"\\r"),
            b'\t' => buf.put_slice(b"\\t"),
            other => buf.put_u8(other),
        }
    }
}
