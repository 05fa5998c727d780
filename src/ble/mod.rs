//! BLE communication module.
//!
//! - [`scanner`]: duty-cycled scanning and advertisement filtering
//! - [`characteristics`]: the GATT client seam and its `btleplug` implementation
//! - [`connection`]: one task per connectable instrument
//! - [`manager`]: correlation of scan results and connections

pub mod characteristics;
pub mod connection;
pub mod manager;
pub mod scanner;
pub mod uuids;

pub use characteristics::{GattClient, Notification, NotificationStream, PeripheralClient};
pub use connection::{ConnectionHandle, DiagnosticQueue, ResultQueue};
pub use manager::BleFleetManager;
pub use scanner::{BleScanner, ScanControl, ScanResult};
pub use uuids::*;
