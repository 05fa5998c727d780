//! Link state, catalyst state and device events.

use std::fmt;

use super::identity::DeviceIdentity;

/// Connection state of one serial session or BLE connection.
///
/// Only the session or connection that owns the link mutates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No link; a new attempt may follow.
    #[default]
    Disconnected,
    /// Opening the link and reading the identity.
    Connecting,
    /// Link up and streaming.
    Connected,
    /// Stop requested; releasing resources.
    Draining,
    /// Stopped for good.
    Closed,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if the link has been stopped for good.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::Draining)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Draining => write!(f, "Draining"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// Catalytic stripper state reported inline by P2 Pro CS instruments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CatalystState {
    /// No marker seen on this connection yet.
    #[default]
    Unknown,
    /// Stripper active.
    On,
    /// Stripper bypassed.
    Off,
}

impl CatalystState {
    /// Value stored in the `cs_status` field: 1 on, 0 off, -1 unknown.
    pub fn cs_status(&self) -> i64 {
        match self {
            CatalystState::Unknown => -1,
            CatalystState::On => 1,
            CatalystState::Off => 0,
        }
    }
}

impl fmt::Display for CatalystState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::On => write!(f, "on"),
            Self::Off => write!(f, "off"),
        }
    }
}

/// Where a device event originated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventSource {
    /// A serial session, named by its port.
    SerialPort(String),
    /// A BLE connection, named by the serial number it serves.
    Ble(u32),
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventSource::SerialPort(port) => write!(f, "{}", port),
            EventSource::Ble(serial) => write!(f, "BLE #{}", serial),
        }
    }
}

/// Notification published by sessions and connections.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// A link changed state.
    StateChanged {
        /// Link that changed.
        source: EventSource,
        /// New state.
        state: ConnectionState,
    },
    /// An identity was read and confirmed.
    IdentityConfirmed {
        /// Link that read it.
        source: EventSource,
        /// The identity.
        identity: DeviceIdentity,
    },
    /// A P2 Pro CS switched its catalytic stripper.
    CatalystChanged {
        /// Instrument serial number.
        serial_number: u32,
        /// New state.
        state: CatalystState,
    },
}
