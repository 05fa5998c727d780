//! Protocol module for decoding instrument data.
//!
//! This module contains the implementations for:
//! - the serial command set and per-family drivers
//! - serial telemetry schemas and line decoding
//! - BLE advertisement frames and GATT notification payloads
//!
//! Everything here is pure: no I/O, no clocks.

pub mod advertisement;
pub mod commands;
pub mod drivers;
pub mod notifications;
pub mod schema;
pub mod serial_line;

pub use advertisement::AdvertisementFrame;
pub use commands::Request;
pub use drivers::{DeviceDriver, DriverRegistry, OutputMode, SchemaSelection};
pub use notifications::NotificationKind;
pub use schema::{FieldType, Schema};
pub use serial_line::{CatalystTracker, DecodedLine, LineDecode, LineDecoder};
