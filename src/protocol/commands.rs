//! Serial command set.
//!
//! Commands are short ASCII strings written without a terminator. Queries
//! end in `?` and are answered with a single tab-separated line; settings end
//! in `!` and are not answered.

/// Read the serial number. Answered with one column.
pub const SERIAL_NUMBER: &str = "N?";

/// Read the firmware version. Answered with one column.
pub const FIRMWARE_VERSION: &str = "f?";

/// Stop the telemetry stream.
pub const VERBOSE_OFF: &str = "X0000!";

/// Start the pro-mode telemetry stream (P2 Pro and P2 Pro CS).
pub const VERBOSE_PRO: &str = "X0006!";

/// Enable harmonics output.
pub const HARMONICS_ON: &str = "h2001!";

/// Enable size distribution measurement.
pub const SIZE_DISTRIBUTION_ON: &str = "M0004!";

/// Disable size distribution measurement.
pub const SIZE_DISTRIBUTION_OFF: &str = "M0000!";

/// Enable the anti-spike filter.
pub const ANTI_SPIKE_ON: &str = "A0001!";

/// Power the instrument off.
pub const POWER_OFF: &str = "off!";

/// Start the standard telemetry stream at `frequency` lines per second.
///
/// Frequencies above 3 are clamped.
///
/// # Example
///
/// ```
/// use naneos_devices::protocol::commands::verbose;
///
/// assert_eq!(verbose(1), "X0001!");
/// assert_eq!(verbose(9), "X0003!");
/// ```
pub fn verbose(frequency: u8) -> String {
    format!("X000{}!", frequency.min(3))
}

/// A command together with the response it expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Command text.
    pub command: String,
    /// Number of columns in a valid answer.
    pub response_columns: usize,
}

impl Request {
    /// Create a request expecting `response_columns` columns.
    pub fn new(command: impl Into<String>, response_columns: usize) -> Self {
        Self {
            command: command.into(),
            response_columns,
        }
    }

    /// The `N?` query.
    pub fn serial_number() -> Self {
        Self::new(SERIAL_NUMBER, 1)
    }

    /// The `f?` query.
    pub fn firmware_version() -> Self {
        Self::new(FIRMWARE_VERSION, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_commands() {
        assert_eq!(verbose(0), VERBOSE_OFF);
        assert_eq!(verbose(2), "X0002!");
    }

    #[test]
    fn test_queries_expect_one_column() {
        assert_eq!(Request::serial_number().response_columns, 1);
        assert_eq!(Request::firmware_version().command, "f?");
    }
}
