//! Measurement and diagnostic records.
//!
//! Every decoder in the crate produces a [`MeasurementRecord`]: a timestamp,
//! the link it came from, and a flat map of named numeric fields. Fields that
//! the instrument did not report are absent rather than zero.
//!
//! Input that could not be decoded ends up as a [`DiagnosticRecord`], which
//! keeps the raw bytes and the reason for rejection.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;

/// Link a measurement record was received over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    /// Decoded from a USB serial telemetry line.
    Serial,
    /// Coalesced from GATT notifications of a connected instrument.
    BleConnected,
    /// Decoded from a BLE advertisement frame.
    BleAdvertisement,
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionType::Serial => "serial",
            ConnectionType::BleConnected => "ble_connected",
            ConnectionType::BleAdvertisement => "ble_advertisement",
        };
        write!(f, "{}", s)
    }
}

/// A single numeric field value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Integer column.
    Int(i64),
    /// Floating point column.
    Float(f64),
}

impl FieldValue {
    /// The value as a float, converting integers.
    pub fn as_f64(&self) -> f64 {
        match *self {
            FieldValue::Int(v) => v as f64,
            FieldValue::Float(v) => v,
        }
    }

    /// The value as an integer; `None` for floats.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            FieldValue::Int(v) => Some(v),
            FieldValue::Float(_) => None,
        }
    }

    /// Whether this is an integer value.
    pub fn is_int(&self) -> bool {
        matches!(self, FieldValue::Int(_))
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        FieldValue::Int(i64::from(v))
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Int(v) => write!(f, "{}", v),
            FieldValue::Float(v) => write!(f, "{}", v),
        }
    }
}

/// One measurement of one instrument at one second.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementRecord {
    /// Receive time in whole Unix seconds.
    pub unix_timestamp: i64,
    /// Link the record was received over.
    pub connection_type: ConnectionType,
    fields: BTreeMap<&'static str, FieldValue>,
}

impl MeasurementRecord {
    /// Create an empty record.
    pub fn new(unix_timestamp: i64, connection_type: ConnectionType) -> Self {
        Self {
            unix_timestamp,
            connection_type,
            fields: BTreeMap::new(),
        }
    }

    /// Set a field, replacing any previous value.
    pub fn set(&mut self, name: &'static str, value: impl Into<FieldValue>) {
        self.fields.insert(name, value.into());
    }

    /// Builder-style [`set`](Self::set).
    pub fn with(mut self, name: &'static str, value: impl Into<FieldValue>) -> Self {
        self.set(name, value);
        self
    }

    /// Get a field value.
    pub fn get(&self, name: &str) -> Option<FieldValue> {
        self.fields.get(name).copied()
    }

    /// Get a field as a float.
    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.get(name).map(|v| v.as_f64())
    }

    /// Get an integer field.
    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(|v| v.as_i64())
    }

    /// Remove a field, returning its old value.
    pub fn remove(&mut self, name: &str) -> Option<FieldValue> {
        self.fields.remove(name)
    }

    /// Whether the field is present.
    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Iterate over the present fields in name order.
    pub fn fields(&self) -> impl Iterator<Item = (&'static str, FieldValue)> + '_ {
        self.fields.iter().map(|(k, v)| (*k, *v))
    }

    /// Number of fields including the timestamp.
    pub fn field_count(&self) -> usize {
        self.fields.len() + 1
    }

    /// Whether no field besides the timestamp is present.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Copy every field of `other` into this record.
    ///
    /// Fields `other` does not carry keep their current value.
    pub fn update_from(&mut self, other: &MeasurementRecord) {
        for (name, value) in other.fields() {
            self.fields.insert(name, value);
        }
    }
}

/// Why an input could not be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeReject {
    /// Nothing left after trimming.
    #[error("empty input")]
    Empty,

    /// The line is not valid ASCII text.
    #[error("line is not ASCII")]
    NotAscii,

    /// The number of columns does not match the active schema.
    #[error("expected {expected} columns, got {actual}")]
    ColumnCount {
        /// Columns in the schema.
        expected: usize,
        /// Columns in the line.
        actual: usize,
    },

    /// A column could not be parsed as its declared type.
    #[error("field {field} has invalid value {value:?}")]
    InvalidNumber {
        /// Schema field name.
        field: &'static str,
        /// The raw column text.
        value: String,
    },

    /// A binary frame has an unexpected length.
    #[error("{frame} frame has invalid length {actual}")]
    InvalidLength {
        /// Frame kind.
        frame: &'static str,
        /// Received length.
        actual: usize,
    },

    /// An advertisement frame does not carry the instrument header.
    #[error("invalid frame header {actual:#04x}")]
    BadHeader {
        /// The byte found at the header position.
        actual: u8,
    },

    /// A response arrived that nobody was waiting for.
    #[error("unsolicited response with {columns} columns")]
    Unsolicited {
        /// Column count of the response.
        columns: usize,
    },
}

/// Raw input that was not turned into a measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticRecord {
    /// Receive time in whole Unix seconds.
    pub unix_timestamp: i64,
    /// The raw bytes as received.
    pub payload: Bytes,
    /// Why decoding failed.
    pub reason: DecodeReject,
}

impl DiagnosticRecord {
    /// Create a diagnostic record.
    pub fn new(unix_timestamp: i64, payload: impl Into<Bytes>, reason: DecodeReject) -> Self {
        Self {
            unix_timestamp,
            payload: payload.into(),
            reason,
        }
    }

    /// The payload as text, with invalid UTF-8 replaced.
    pub fn payload_lossy(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}
