//! Error types for the naneos-devices crate.

use thiserror::Error;

use crate::config::ConfigError;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// Error reported by the serial port layer.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Plain I/O error while talking to a device.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The requested device could not be found.
    #[error("Device not found: {identifier}")]
    DeviceNotFound {
        /// The identifier that was searched for.
        identifier: String,
    },

    /// Operation requires a connection but the device is not connected.
    #[error("Device not connected")]
    NotConnected,

    /// The connection to the device was lost.
    #[error("Connection lost")]
    ConnectionLost,

    /// A time-boxed operation did not finish in time.
    #[error("Timed out during {operation}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
    },

    /// The device did not answer a command with a usable response.
    #[error("No valid response to command {command:?}")]
    NoResponse {
        /// The command that was sent.
        command: String,
    },

    /// Repeated serial number reads disagreed with each other.
    #[error("Inconsistent serial number reads: {reads:?}")]
    InconsistentSerialNumber {
        /// The values that were read.
        reads: Vec<u32>,
    },

    /// The device answered with a serial number other than the confirmed one.
    #[error("Serial number changed from {expected} to {actual}")]
    IdentityMismatch {
        /// The serial number confirmed at connect time.
        expected: u32,
        /// The serial number read during the health check.
        actual: u32,
    },

    /// Invalid data was received from the device.
    #[error("Invalid data received: {context}")]
    InvalidData {
        /// Description of what was invalid about the data.
        context: String,
    },

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a timeout error for the named operation.
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Whether this error is an expected, transient link failure.
    ///
    /// Transient failures are retried after the long back-off and logged as
    /// warnings; everything else is retried quickly but logged as an error.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::DeviceNotFound { .. } | Self::NotConnected => true,
            Self::Bluetooth(e) => matches!(
                e,
                btleplug::Error::DeviceNotFound
                    | btleplug::Error::TimedOut(_)
                    | btleplug::Error::NotConnected
            ),
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::NotFound
            ),
            _ => false,
        }
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_transient_classification() {
        assert!(Error::timeout("connect").is_transient());
        assert!(Error::DeviceNotFound {
            identifier: "8112".to_string()
        }
        .is_transient());
        assert!(Error::Bluetooth(btleplug::Error::TimedOut(Duration::from_secs(5))).is_transient());
        assert!(Error::Bluetooth(btleplug::Error::DeviceNotFound).is_transient());

        assert!(!Error::Internal("boom".to_string()).is_transient());
        assert!(!Error::InconsistentSerialNumber {
            reads: vec![8112, 8112, 8113]
        }
        .is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = Error::IdentityMismatch {
            expected: 8112,
            actual: 8113,
        };
        assert_eq!(err.to_string(), "Serial number changed from 8112 to 8113");

        let err = Error::timeout("disconnect");
        assert_eq!(err.to_string(), "Timed out during disconnect");
    }
}
