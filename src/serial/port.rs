//! Serial port access.
//!
//! Sessions talk to ports through the blocking [`SerialLink`] trait and find
//! them through [`SerialBackend`]. [`SystemSerial`] implements both on top of
//! the `serialport` crate.

use std::io::{ErrorKind, Read, Write};

use serialport::{ClearBuffer, SerialPortType};
use tracing::{debug, trace};

use crate::config::SerialConfig;
use crate::data::DeviceFamily;
use crate::error::{Error, Result};

/// Maximum bytes buffered while waiting for a line terminator.
const MAX_LINE_LEN: usize = 4096;

/// An open, line-oriented serial connection.
pub trait SerialLink: Send {
    /// Write a command as-is.
    fn write_command(&mut self, command: &str) -> Result<()>;

    /// Read the next CRLF-terminated line including its terminator.
    ///
    /// Returns `Ok(None)` when the read timeout passes without a full line.
    fn read_line(&mut self) -> Result<Option<Vec<u8>>>;

    /// Discard pending input.
    fn clear_input(&mut self) -> Result<()>;
}

/// Discovered serial port.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PortInfo {
    /// OS name of the port, e.g. `/dev/ttyACM0` or `COM3`.
    pub name: String,
    /// USB vendor id.
    pub vid: Option<u16>,
    /// USB product id.
    pub pid: Option<u16>,
    /// USB manufacturer string.
    pub manufacturer: Option<String>,
    /// USB product string.
    pub product: Option<String>,
}

impl PortInfo {
    /// Whether this port looks like an instrument under `config`.
    pub fn matches(&self, config: &SerialConfig) -> bool {
        if let Some(vid) = self.vid {
            if config.vendor_ids.contains(&vid) {
                return true;
            }
        }
        let description = self.description().to_ascii_lowercase();
        config
            .vendor_keywords
            .iter()
            .any(|keyword| description.contains(&keyword.to_ascii_lowercase()))
    }

    /// Family hinted by the USB strings.
    ///
    /// Ports matched only by vendor id are assumed to be Partector 2.
    pub fn family(&self) -> DeviceFamily {
        self.product
            .as_deref()
            .and_then(DeviceFamily::from_usb_description)
            .or_else(|| {
                DeviceFamily::from_usb_description(&self.description())
            })
            .unwrap_or(DeviceFamily::P2)
    }

    fn description(&self) -> String {
        let mut text = String::new();
        if let Some(m) = &self.manufacturer {
            text.push_str(m);
        }
        if let Some(p) = &self.product {
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(p);
        }
        text
    }
}

/// Port discovery and opening.
pub trait SerialBackend: Send + Sync {
    /// List the ports currently present.
    fn list_ports(&self) -> Result<Vec<PortInfo>>;

    /// Open a port with the configured settings.
    fn open(&self, port: &str, config: &SerialConfig) -> Result<Box<dyn SerialLink>>;
}

/// Backend for the ports of this machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemSerial;

impl SerialBackend for SystemSerial {
    fn list_ports(&self) -> Result<Vec<PortInfo>> {
        let ports = serialport::available_ports()?;
        Ok(ports
            .into_iter()
            .map(|port| match port.port_type {
                SerialPortType::UsbPort(usb) => PortInfo {
                    name: port.port_name,
                    vid: Some(usb.vid),
                    pid: Some(usb.pid),
                    manufacturer: usb.manufacturer,
                    product: usb.product,
                },
                _ => PortInfo {
                    name: port.port_name,
                    ..Default::default()
                },
            })
            .collect())
    }

    fn open(&self, port: &str, config: &SerialConfig) -> Result<Box<dyn SerialLink>> {
        debug!("Opening serial port {} at {} baud", port, config.baud_rate);
        let handle = serialport::new(port, config.baud_rate)
            .timeout(config.read_timeout())
            .open()?;
        Ok(Box::new(SystemLink {
            port: handle,
            pending: Vec::new(),
        }))
    }
}

/// [`SerialLink`] over an OS serial port.
pub struct SystemLink {
    port: Box<dyn serialport::SerialPort>,
    pending: Vec<u8>,
}

impl SystemLink {
    fn take_line(&mut self) -> Option<Vec<u8>> {
        let end = self.pending.iter().position(|b| *b == b'\n')?;
        Some(self.pending.drain(..=end).collect())
    }
}

impl SerialLink for SystemLink {
    fn write_command(&mut self, command: &str) -> Result<()> {
        trace!("-> {}", command);
        self.port.write_all(command.as_bytes())?;
        self.port.flush()?;
        Ok(())
    }

    fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        if let Some(line) = self.take_line() {
            return Ok(Some(line));
        }

        let mut buf = [0u8; 256];
        match self.port.read(&mut buf) {
            Ok(0) => Ok(None),
            Ok(n) => {
                self.pending.extend_from_slice(&buf[..n]);
                if self.pending.len() > MAX_LINE_LEN && !self.pending.contains(&b'\n') {
                    // Garbage without terminator; keep memory bounded.
                    let line = std::mem::take(&mut self.pending);
                    return Ok(Some(line));
                }
                Ok(self.take_line())
            }
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::Interrupted => {
                Ok(None)
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn clear_input(&mut self) -> Result<()> {
        self.pending.clear();
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb_port(manufacturer: &str, product: &str) -> PortInfo {
        PortInfo {
            name: "/dev/ttyACM0".to_string(),
            vid: Some(0x0483),
            pid: Some(0x5740),
            manufacturer: Some(manufacturer.to_string()),
            product: Some(product.to_string()),
        }
    }

    #[test]
    fn test_port_matching() {
        let config = SerialConfig::default();
        assert!(usb_port("naneos", "Partector2").matches(&config));
        assert!(!usb_port("FTDI", "FT232R").matches(&config));
        assert!(!PortInfo::default().matches(&config));

        let mut by_vid = config.clone();
        by_vid.vendor_ids = vec![0x0483];
        assert!(usb_port("STMicro", "Virtual COM").matches(&by_vid));
    }

    #[test]
    fn test_port_family() {
        assert_eq!(
            usb_port("naneos", "Partector2 pro").family(),
            DeviceFamily::P2Pro
        );
        assert_eq!(usb_port("naneos", "Partector").family(), DeviceFamily::P1);
        assert_eq!(
            usb_port("naneos", "Partector2 Pro Garage").family(),
            DeviceFamily::P2ProCS
        );
        assert_eq!(usb_port("naneos", "Virtual COM").family(), DeviceFamily::P2);
    }
}
