//! Per-family serial drivers.
//!
//! A [`DeviceDriver`] knows which telemetry schema a firmware version prints
//! and which commands start and stop the stream. The [`DriverRegistry`] maps
//! each [`DeviceFamily`] to its driver.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::commands;
use super::schema::{self, Schema};
use crate::data::DeviceFamily;

/// Firmware version from which each family prints its latest layout.
pub const P2_LATEST_FIRMWARE: u16 = 320;
/// First P2 Pro firmware with the v311 layout.
pub const P2PRO_MIN_FIRMWARE: u16 = 311;
/// First P2 Pro firmware with the v336 layout.
pub const P2PRO_LATEST_FIRMWARE: u16 = 336;
/// First P2 Pro CS firmware with the v315 layout.
pub const P2PRO_CS_MIN_FIRMWARE: u16 = 315;

/// Output layout requested from a P2 Pro.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Partector 2 compatible output.
    Standard,
    /// Extended output with size distribution.
    #[default]
    Pro,
}

/// Result of a schema lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaSelection {
    /// Schema to decode with.
    pub schema: Schema,
    /// The firmware has no dedicated layout; a fallback was chosen and the
    /// instrument should be updated.
    pub fallback: bool,
}

impl SchemaSelection {
    fn exact(schema: Schema) -> Self {
        Self {
            schema,
            fallback: false,
        }
    }

    fn fallback(schema: Schema) -> Self {
        Self {
            schema,
            fallback: true,
        }
    }
}

/// Family specific serial behavior.
pub trait DeviceDriver: Send + Sync {
    /// The family this driver serves.
    fn family(&self) -> DeviceFamily;

    /// Schema printed by the given firmware version.
    fn select_schema(&self, firmware_version: u16) -> SchemaSelection;

    /// Commands that start the telemetry stream, in order.
    fn verbose_on(&self) -> Vec<String>;

    /// Commands that stop the telemetry stream, in order.
    fn verbose_off(&self) -> Vec<String> {
        vec![commands::VERBOSE_OFF.to_string()]
    }

    /// Whether lines carry inline catalyst markers.
    fn tracks_catalyst(&self) -> bool {
        false
    }
}

/// Partector (first generation).
#[derive(Debug, Clone, Copy)]
pub struct P1Driver {
    /// Lines per second.
    pub frequency: u8,
}

impl DeviceDriver for P1Driver {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::P1
    }

    fn select_schema(&self, _firmware_version: u16) -> SchemaSelection {
        SchemaSelection::exact(schema::P1_LEGACY)
    }

    fn verbose_on(&self) -> Vec<String> {
        vec![commands::verbose(self.frequency.max(1))]
    }
}

/// Partector 2.
#[derive(Debug, Clone, Copy)]
pub struct P2Driver {
    /// Lines per second.
    pub frequency: u8,
}

impl DeviceDriver for P2Driver {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::P2
    }

    fn select_schema(&self, firmware_version: u16) -> SchemaSelection {
        match firmware_version {
            v if v >= P2_LATEST_FIRMWARE => SchemaSelection::exact(schema::P2_V320),
            295 | 297 | 298 => SchemaSelection::exact(schema::P2_V295_V297_V298),
            265 | 275 => SchemaSelection::exact(schema::P2_V265_V275),
            _ => SchemaSelection::fallback(schema::P2_LEGACY),
        }
    }

    fn verbose_on(&self) -> Vec<String> {
        vec![commands::verbose(self.frequency.max(1))]
    }
}

/// Partector 2 Pro.
#[derive(Debug, Clone, Copy)]
pub struct P2ProDriver {
    /// Requested output layout.
    pub mode: OutputMode,
    /// Lines per second in standard mode.
    pub frequency: u8,
}

impl DeviceDriver for P2ProDriver {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::P2Pro
    }

    fn select_schema(&self, firmware_version: u16) -> SchemaSelection {
        match self.mode {
            OutputMode::Pro => match firmware_version {
                v if v >= P2PRO_LATEST_FIRMWARE => SchemaSelection::exact(schema::P2PRO_V336),
                v if v >= P2PRO_MIN_FIRMWARE => SchemaSelection::exact(schema::P2PRO_V311),
                _ => SchemaSelection::fallback(schema::P2PRO_V311),
            },
            OutputMode::Standard => {
                if firmware_version >= P2PRO_MIN_FIRMWARE {
                    SchemaSelection::exact(schema::P2_V320)
                } else {
                    SchemaSelection::fallback(schema::P2_LEGACY)
                }
            }
        }
    }

    fn verbose_on(&self) -> Vec<String> {
        match self.mode {
            OutputMode::Pro => vec![
                commands::VERBOSE_PRO.to_string(),
                commands::HARMONICS_ON.to_string(),
                commands::SIZE_DISTRIBUTION_ON.to_string(),
                commands::ANTI_SPIKE_ON.to_string(),
            ],
            OutputMode::Standard => vec![
                commands::HARMONICS_ON.to_string(),
                commands::SIZE_DISTRIBUTION_OFF.to_string(),
                commands::verbose(self.frequency.max(1)),
            ],
        }
    }
}

/// Partector 2 Pro with catalytic stripper.
#[derive(Debug, Clone, Copy, Default)]
pub struct P2ProCsDriver;

impl DeviceDriver for P2ProCsDriver {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::P2ProCS
    }

    fn select_schema(&self, firmware_version: u16) -> SchemaSelection {
        if firmware_version >= P2PRO_CS_MIN_FIRMWARE {
            SchemaSelection::exact(schema::P2PRO_CS_V315)
        } else {
            SchemaSelection::fallback(schema::P2PRO_CS_V315)
        }
    }

    fn verbose_on(&self) -> Vec<String> {
        vec![commands::VERBOSE_PRO.to_string()]
    }

    fn tracks_catalyst(&self) -> bool {
        true
    }
}

/// Driver lookup by family.
#[derive(Clone)]
pub struct DriverRegistry {
    drivers: HashMap<DeviceFamily, Arc<dyn DeviceDriver>>,
}

impl DriverRegistry {
    /// Registry with the built-in drivers.
    pub fn new(frequency: u8, p2pro_output: OutputMode) -> Self {
        let mut registry = Self {
            drivers: HashMap::new(),
        };
        registry.register(Arc::new(P1Driver { frequency }));
        registry.register(Arc::new(P2Driver { frequency }));
        registry.register(Arc::new(P2ProDriver {
            mode: p2pro_output,
            frequency,
        }));
        registry.register(Arc::new(P2ProCsDriver));
        registry
    }

    /// Replace the driver of its family.
    pub fn register(&mut self, driver: Arc<dyn DeviceDriver>) {
        self.drivers.insert(driver.family(), driver);
    }

    /// Driver for a family.
    pub fn get(&self, family: DeviceFamily) -> Option<Arc<dyn DeviceDriver>> {
        self.drivers.get(&family).cloned()
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new(1, OutputMode::Pro)
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut families: Vec<_> = self.drivers.keys().collect();
        families.sort();
        f.debug_struct("DriverRegistry")
            .field("families", &families)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema_for(family: DeviceFamily, fw: u16) -> SchemaSelection {
        DriverRegistry::default()
            .get(family)
            .unwrap()
            .select_schema(fw)
    }

    #[test]
    fn test_p2_schema_selection() {
        assert_eq!(schema_for(DeviceFamily::P2, 320).schema, schema::P2_V320);
        assert_eq!(schema_for(DeviceFamily::P2, 351).schema, schema::P2_V320);
        assert_eq!(
            schema_for(DeviceFamily::P2, 297).schema,
            schema::P2_V295_V297_V298
        );
        assert_eq!(schema_for(DeviceFamily::P2, 265).schema, schema::P2_V265_V275);

        let old = schema_for(DeviceFamily::P2, 250);
        assert_eq!(old.schema, schema::P2_LEGACY);
        assert!(old.fallback);
        assert!(schema_for(DeviceFamily::P2, 296).fallback);
    }

    #[test]
    fn test_p2pro_schema_selection() {
        assert_eq!(schema_for(DeviceFamily::P2Pro, 336).schema, schema::P2PRO_V336);
        assert_eq!(schema_for(DeviceFamily::P2Pro, 320).schema, schema::P2PRO_V311);
        assert!(!schema_for(DeviceFamily::P2Pro, 311).fallback);
        assert!(schema_for(DeviceFamily::P2Pro, 300).fallback);

        let standard = P2ProDriver {
            mode: OutputMode::Standard,
            frequency: 1,
        };
        assert_eq!(standard.select_schema(336).schema, schema::P2_V320);
        assert!(standard.select_schema(305).fallback);
    }

    #[test]
    fn test_cs_schema_selection() {
        let selection = schema_for(DeviceFamily::P2ProCS, 315);
        assert_eq!(selection.schema, schema::P2PRO_CS_V315);
        assert!(!selection.fallback);
        assert!(schema_for(DeviceFamily::P2ProCS, 300).fallback);
    }

    #[test]
    fn test_verbose_commands_per_family() {
        let registry = DriverRegistry::new(2, OutputMode::Pro);
        assert_eq!(
            registry.get(DeviceFamily::P2).unwrap().verbose_on(),
            vec!["X0002!"]
        );
        assert_eq!(
            registry.get(DeviceFamily::P2Pro).unwrap().verbose_on(),
            vec!["X0006!", "h2001!", "M0004!", "A0001!"]
        );
        let cs = registry.get(DeviceFamily::P2ProCS).unwrap();
        assert_eq!(cs.verbose_on(), vec!["X0006!"]);
        assert_eq!(cs.verbose_off(), vec!["X0000!"]);
        assert!(cs.tracks_catalyst());
    }
}
