//! Runtime configuration.
//!
//! Every timeout, interval and capacity used by the connection layer lives
//! here. Values are plain integers in the TOML file and are exposed as
//! [`Duration`]s through accessor methods.
//!
//! ```toml
//! [serial]
//! baud_rate = 115200
//! power_off_on_shutdown = false
//!
//! [ble]
//! device_names = ["P2", "PartectorBT"]
//! connect_timeout_ms = 5000
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::drivers::OutputMode;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Supervisor and upload cadence.
    pub manager: ManagerConfig,
    /// Serial transport settings.
    pub serial: SerialConfig,
    /// BLE transport settings.
    pub ble: BleConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: Some(path.as_ref().to_path_buf()),
            source: e,
        })
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: None,
            source: e,
        })
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration and return every problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        errors.extend(self.manager.validate());
        errors.extend(self.serial.validate());
        errors.extend(self.ble.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

/// Settings for the top-level device manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Supervisor tick, in milliseconds.
    pub tick_interval_ms: u64,
    /// Seconds between two hand-offs to the uploader.
    pub upload_interval_secs: u64,
    /// Records kept per device between uploads; older ones are dropped.
    pub max_records_per_device: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            upload_interval_secs: 15,
            max_records_per_device: 3600,
        }
    }
}

impl ManagerConfig {
    /// Supervisor tick.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Upload cadence.
    pub fn upload_interval(&self) -> Duration {
        Duration::from_secs(self.upload_interval_secs)
    }

    fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.tick_interval_ms == 0 {
            errors.push(ValidationError::new("manager.tick_interval_ms", "must be > 0"));
        }
        if self.upload_interval_secs == 0 {
            errors.push(ValidationError::new(
                "manager.upload_interval_secs",
                "must be > 0",
            ));
        }
        if self.max_records_per_device == 0 {
            errors.push(ValidationError::new(
                "manager.max_records_per_device",
                "must be > 0",
            ));
        }
        errors
    }
}

/// Settings for serial (USB CDC) instruments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Whether serial devices are managed at all.
    pub enabled: bool,
    /// Port baud rate.
    pub baud_rate: u32,
    /// Upper bound of a single blocking read.
    pub read_timeout_ms: u64,
    /// How long to wait for the answer to one command.
    pub response_timeout_ms: u64,
    /// Attempts per request/response exchange.
    pub request_retries: u32,
    /// Interval of the serial number health check.
    pub health_check_interval_ms: u64,
    /// Interval between two port discovery passes.
    pub scan_interval_ms: u64,
    /// How long shutdown waits for one session before detaching it.
    pub shutdown_timeout_ms: u64,
    /// Capacity of each session's measurement queue.
    pub measurement_queue_capacity: usize,
    /// Capacity of each session's diagnostic queue.
    pub diagnostic_queue_capacity: usize,
    /// Send `off!` to the instrument on graceful shutdown.
    pub power_off_on_shutdown: bool,
    /// Lines per second requested from P1 and P2 instruments (1 to 3).
    pub verbose_frequency: u8,
    /// Output layout requested from P2 Pro instruments.
    pub p2pro_output: OutputMode,
    /// USB vendor ids that identify instrument ports.
    pub vendor_ids: Vec<u16>,
    /// Case-insensitive keywords matched against USB manufacturer/product strings.
    pub vendor_keywords: Vec<String>,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            baud_rate: 115_200,
            read_timeout_ms: 200,
            response_timeout_ms: 500,
            request_retries: 3,
            health_check_interval_ms: 2100,
            scan_interval_ms: 1000,
            shutdown_timeout_ms: 3000,
            measurement_queue_capacity: 300,
            diagnostic_queue_capacity: 100,
            power_off_on_shutdown: false,
            verbose_frequency: 1,
            p2pro_output: OutputMode::Pro,
            vendor_ids: Vec::new(),
            vendor_keywords: vec!["naneos".to_string(), "partector".to_string()],
        }
    }
}

impl SerialConfig {
    /// Upper bound of a single blocking read.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Response wait per command.
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Health check interval.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Port discovery interval.
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    /// Per-session shutdown bound.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.baud_rate == 0 {
            errors.push(ValidationError::new("serial.baud_rate", "must be > 0"));
        }
        if self.read_timeout_ms == 0 {
            errors.push(ValidationError::new(
                "serial.read_timeout_ms",
                "must be > 0, reads may never block indefinitely",
            ));
        }
        if self.response_timeout_ms < self.read_timeout_ms {
            errors.push(ValidationError::new(
                "serial.response_timeout_ms",
                "must be >= read_timeout_ms",
            ));
        }
        if self.request_retries == 0 {
            errors.push(ValidationError::new("serial.request_retries", "must be > 0"));
        }
        if !(1..=3).contains(&self.verbose_frequency) {
            errors.push(ValidationError::new(
                "serial.verbose_frequency",
                "must be between 1 and 3",
            ));
        }
        if self.measurement_queue_capacity == 0 || self.diagnostic_queue_capacity == 0 {
            errors.push(ValidationError::new(
                "serial.*_queue_capacity",
                "queue capacities must be > 0",
            ));
        }
        if self.vendor_ids.is_empty() && self.vendor_keywords.is_empty() {
            errors.push(ValidationError::new(
                "serial.vendor_keywords",
                "at least one vendor id or keyword is required to find ports",
            ));
        }
        errors
    }
}

/// Settings for Bluetooth Low Energy instruments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    /// Whether BLE devices are managed at all.
    pub enabled: bool,
    /// Advertised local names accepted by the scanner.
    pub device_names: Vec<String>,
    /// Subset of `device_names` that accept GATT connections.
    pub connectable_names: Vec<String>,
    /// Length of one active scan window.
    pub scan_window_ms: u64,
    /// Pause after a failed scan window.
    pub scan_error_backoff_ms: u64,
    /// Capacity of the fleet-wide scan result queue.
    pub scan_queue_capacity: usize,
    /// Capacity of the fleet-wide connection result queue.
    pub result_queue_capacity: usize,
    /// Capacity of the fleet-wide diagnostic queue.
    pub diagnostic_queue_capacity: usize,
    /// Bound of one GATT connect attempt.
    pub connect_timeout_ms: u64,
    /// Bound of one subscribe or unsubscribe call.
    pub notify_timeout_ms: u64,
    /// Bound of the disconnect call.
    pub disconnect_timeout_ms: u64,
    /// Back-off after a timeout or "device not found".
    pub transient_backoff_ms: u64,
    /// Back-off after any other failure.
    pub error_backoff_ms: u64,
    /// How long shutdown waits for one connection before detaching it.
    pub shutdown_timeout_ms: u64,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            device_names: vec!["P2".to_string(), "PartectorBT".to_string()],
            connectable_names: vec!["P2".to_string(), "PartectorBT".to_string()],
            scan_window_ms: 800,
            scan_error_backoff_ms: 500,
            scan_queue_capacity: 100,
            result_queue_capacity: 300,
            diagnostic_queue_capacity: 100,
            connect_timeout_ms: 5000,
            notify_timeout_ms: 2000,
            disconnect_timeout_ms: 3000,
            transient_backoff_ms: 4500,
            error_backoff_ms: 500,
            shutdown_timeout_ms: 12_000,
        }
    }
}

impl BleConfig {
    /// Length of one active scan window.
    pub fn scan_window(&self) -> Duration {
        Duration::from_millis(self.scan_window_ms)
    }

    /// Pause after a failed scan window.
    pub fn scan_error_backoff(&self) -> Duration {
        Duration::from_millis(self.scan_error_backoff_ms)
    }

    /// Connect bound.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Subscribe/unsubscribe bound.
    pub fn notify_timeout(&self) -> Duration {
        Duration::from_millis(self.notify_timeout_ms)
    }

    /// Disconnect bound.
    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    /// Back-off for expected failures.
    pub fn transient_backoff(&self) -> Duration {
        Duration::from_millis(self.transient_backoff_ms)
    }

    /// Back-off for unexpected failures.
    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    /// Per-connection shutdown bound.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Whether an advertised name belongs to an instrument.
    pub fn is_instrument_name(&self, name: &str) -> bool {
        self.device_names.iter().any(|n| n == name)
    }

    /// Whether an advertised name accepts GATT connections.
    pub fn is_connectable_name(&self, name: &str) -> bool {
        self.connectable_names.iter().any(|n| n == name)
    }

    fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.device_names.is_empty() {
            errors.push(ValidationError::new("ble.device_names", "must not be empty"));
        }
        for name in &self.connectable_names {
            if !self.device_names.contains(name) {
                errors.push(ValidationError::new(
                    "ble.connectable_names",
                    format!("'{}' is not listed in device_names", name),
                ));
            }
        }
        for (field, value) in [
            ("ble.scan_window_ms", self.scan_window_ms),
            ("ble.connect_timeout_ms", self.connect_timeout_ms),
            ("ble.notify_timeout_ms", self.notify_timeout_ms),
            ("ble.disconnect_timeout_ms", self.disconnect_timeout_ms),
        ] {
            if value == 0 {
                errors.push(ValidationError::new(field, "must be > 0"));
            }
        }
        if self.scan_queue_capacity == 0
            || self.result_queue_capacity == 0
            || self.diagnostic_queue_capacity == 0
        {
            errors.push(ValidationError::new(
                "ble.*_queue_capacity",
                "queue capacities must be > 0",
            ));
        }
        errors
    }
}

/// A single validation problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    /// What is wrong with it.
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path of the file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The content is not valid TOML for [`Config`].
    #[error("failed to parse config{}: {source}", .path.as_ref().map(|p| format!(" file {}", p.display())).unwrap_or_default())]
    Parse {
        /// Path of the file, if loaded from disk.
        path: Option<PathBuf>,
        /// Underlying TOML error.
        source: toml::de::Error,
    },

    /// One or more values are out of range.
    #[error("invalid configuration: {}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Validation(Vec<ValidationError>),
}
