// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # naneos-devices
//!
//! Connection and decoding layer for naneos Partector aerosol instruments
//! reachable over USB-serial and Bluetooth Low Energy.
//!
//! The crate discovers instruments, keeps one supervised link per device,
//! decodes the serial text protocol and the BLE advertisement and
//! notification payloads, and produces one [`MeasurementRecord`] per
//! instrument per second.
//!
//! ## Features
//!
//! - **Serial sessions**: identity check, firmware-dependent schemas and a
//!   periodic serial number health check
//! - **BLE**: duty-cycled scanning, advertisement decoding and GATT
//!   connections with back-off
//! - **Bounded buffering**: drop-oldest queues between every producer and
//!   consumer
//! - **Upload hand-off**: batches per device every upload interval through
//!   the [`Uploader`] trait
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use naneos_devices::{ChannelUploader, Config, DeviceManager};
//!
//! #[tokio::main]
//! async fn main() -> naneos_devices::Result<()> {
//!     let config = Config::default();
//!     config.validate()?;
//!
//!     let (uploader, mut batches) = ChannelUploader::new(4);
//!     let manager = DeviceManager::start(config, Arc::new(uploader)).await;
//!
//!     if let Some(batches) = batches.recv().await {
//!         for batch in batches {
//!             println!("#{}: {} records", batch.serial_number, batch.records.len());
//!         }
//!     }
//!
//!     manager.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### Linux
//! BLE requires BlueZ; serial ports usually require membership in the
//! `dialout` group.
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.

// Public modules
pub mod ble;
pub mod config;
pub mod data;
pub mod device_manager;
pub mod error;
pub mod protocol;
pub mod queue;
pub mod serial;
pub mod upload;
pub mod utils;

#[cfg(test)]
mod test_support;

// Re-exports for convenience
pub use config::{BleConfig, Config, ConfigError, ManagerConfig, SerialConfig};
pub use device_manager::{DeviceManager, ManagerStatus};
pub use error::{Error, Result};
pub use queue::BoundedQueue;
pub use upload::{ChannelUploader, Uploader};

// Re-export commonly used types from submodules
pub use ble::BleFleetManager;
pub use data::{
    CatalystState, ConnectionState, ConnectionType, DecodeReject, DeviceBatch, DeviceEvent,
    DeviceFamily, DeviceIdentity, DiagnosticRecord, EventSource, FieldValue, FleetAggregate,
    MeasurementRecord, Transport,
};
pub use serial::SerialFleetManager;
