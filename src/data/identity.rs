//! Instrument identity.
//!
//! A [`DeviceIdentity`] is read from the instrument once per connection and
//! never changes afterwards. The serial number is the key every fleet
//! structure uses.

use std::fmt;

use serde::Serialize;

/// Instrument family of the Partector line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum DeviceFamily {
    /// Partector (first generation).
    P1,
    /// Partector 2.
    P2,
    /// Partector 2 Pro.
    P2Pro,
    /// Partector 2 Pro with catalytic stripper (garage variant).
    P2ProCS,
}

impl DeviceFamily {
    /// All families, in registry order.
    pub const ALL: [DeviceFamily; 4] = [
        DeviceFamily::P1,
        DeviceFamily::P2,
        DeviceFamily::P2Pro,
        DeviceFamily::P2ProCS,
    ];

    /// Guess the family from a USB product or manufacturer description.
    ///
    /// Returns `None` when the description does not look like a Partector.
    ///
    /// # Example
    ///
    /// ```
    /// use naneos_devices::data::DeviceFamily;
    ///
    /// assert_eq!(DeviceFamily::from_usb_description("Partector 2 pro"), Some(DeviceFamily::P2Pro));
    /// assert_eq!(DeviceFamily::from_usb_description("Partector2"), Some(DeviceFamily::P2));
    /// assert_eq!(DeviceFamily::from_usb_description("FT232R USB UART"), None);
    /// ```
    pub fn from_usb_description(description: &str) -> Option<Self> {
        let lower = description.to_ascii_lowercase();
        if !lower.contains("partector") {
            return None;
        }

        let has_word = |word: &str| {
            lower
                .split(|c: char| !c.is_ascii_alphanumeric())
                .any(|token| token == word)
        };

        let family = if has_word("garage") || has_word("cs") {
            DeviceFamily::P2ProCS
        } else if has_word("pro") {
            DeviceFamily::P2Pro
        } else if lower.contains('2') {
            DeviceFamily::P2
        } else {
            DeviceFamily::P1
        };
        Some(family)
    }

    /// Human readable product name.
    pub fn product_name(&self) -> &'static str {
        match self {
            DeviceFamily::P1 => "Partector",
            DeviceFamily::P2 => "Partector 2",
            DeviceFamily::P2Pro => "Partector 2 Pro",
            DeviceFamily::P2ProCS => "Partector 2 Pro CS",
        }
    }
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceFamily::P1 => "P1",
            DeviceFamily::P2 => "P2",
            DeviceFamily::P2Pro => "P2Pro",
            DeviceFamily::P2ProCS => "P2ProCS",
        };
        write!(f, "{}", s)
    }
}

/// Link an identity was confirmed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Transport {
    /// USB serial port.
    Serial,
    /// Bluetooth Low Energy.
    Ble,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Serial => write!(f, "serial"),
            Transport::Ble => write!(f, "BLE"),
        }
    }
}

/// Confirmed identity of one instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DeviceIdentity {
    /// Factory serial number.
    pub serial_number: u32,
    /// Firmware version as reported by `f?`; 0 when unknown.
    pub firmware_version: u16,
    /// Instrument family.
    pub device_family: DeviceFamily,
    /// Link the identity was read over.
    pub transport: Transport,
}

impl DeviceIdentity {
    /// Identity of an instrument seen over BLE.
    ///
    /// BLE frames carry no firmware version, so it is left at 0.
    pub fn ble(serial_number: u32) -> Self {
        Self {
            serial_number,
            firmware_version: 0,
            device_family: DeviceFamily::P2,
            transport: Transport::Ble,
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} #{} (fw {}, {})",
            self.device_family, self.serial_number, self.firmware_version, self.transport
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_from_usb_description() {
        assert_eq!(
            DeviceFamily::from_usb_description("Partector"),
            Some(DeviceFamily::P1)
        );
        assert_eq!(
            DeviceFamily::from_usb_description("naneos Partector2"),
            Some(DeviceFamily::P2)
        );
        assert_eq!(
            DeviceFamily::from_usb_description("Partector2 Pro"),
            Some(DeviceFamily::P2Pro)
        );
        assert_eq!(
            DeviceFamily::from_usb_description("Partector2 Pro Garage"),
            Some(DeviceFamily::P2ProCS)
        );
        assert_eq!(
            DeviceFamily::from_usb_description("Partector2 Pro-CS"),
            Some(DeviceFamily::P2ProCS)
        );
        // Family words only count as whole words.
        assert_eq!(
            DeviceFamily::from_usb_description("Acme Electronics Partector"),
            Some(DeviceFamily::P1)
        );
        assert_eq!(
            DeviceFamily::from_usb_description("Partector2 Products"),
            Some(DeviceFamily::P2)
        );
        assert_eq!(DeviceFamily::from_usb_description("CP2102"), None);
    }

    #[test]
    fn test_identity_display() {
        let id = DeviceIdentity {
            serial_number: 8112,
            firmware_version: 336,
            device_family: DeviceFamily::P2Pro,
            transport: Transport::Serial,
        };
        assert_eq!(id.to_string(), "P2Pro #8112 (fw 336, serial)");
        assert_eq!(DeviceIdentity::ble(42).device_family, DeviceFamily::P2);
    }
}
