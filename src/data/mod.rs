//! Data structures for instrument data.
//!
//! This module contains the types shared by the serial and BLE halves of the
//! crate: identities, measurement and diagnostic records, link states and
//! the per-device aggregate.

pub mod aggregate;
pub mod identity;
pub mod measurement;
pub mod state;

pub use aggregate::{DeviceBatch, FleetAggregate};
pub use identity::{DeviceFamily, DeviceIdentity, Transport};
pub use measurement::{
    ConnectionType, DecodeReject, DiagnosticRecord, FieldValue, MeasurementRecord,
};
pub use state::{CatalystState, ConnectionState, DeviceEvent, EventSource};
