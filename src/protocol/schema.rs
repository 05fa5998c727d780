//! Column schemas of the serial telemetry stream.
//!
//! With verbose output enabled, an instrument prints one tab-separated line
//! per measurement. The column layout depends on the instrument family and
//! the firmware version; each known layout is one [`Schema`] constant here.
//! The receive timestamp is not part of a schema.

use std::fmt;

/// Declared type of one column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// Parsed as `i64`.
    Int,
    /// Parsed as `f64`.
    Float,
}

/// Ordered column layout of a telemetry line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schema {
    /// Short name used in logs.
    pub name: &'static str,
    /// Columns in line order.
    pub fields: &'static [(&'static str, FieldType)],
}

impl Schema {
    /// Number of columns in a telemetry line.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the schema has no columns.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Position of a column by name.
    pub fn position(&self, field: &str) -> Option<usize> {
        self.fields.iter().position(|(name, _)| *name == field)
    }

    /// Whether the schema carries a column.
    pub fn contains(&self, field: &str) -> bool {
        self.position(field).is_some()
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} columns)", self.name, self.fields.len())
    }
}

use FieldType::{Float, Int};

/// Size distribution number columns of the P2 Pro family.
pub const SIZE_DISTRIBUTION_FIELDS: [&str; 8] = [
    "dist_particle_number_10nm",
    "dist_particle_number_16nm",
    "dist_particle_number_26nm",
    "dist_particle_number_43nm",
    "dist_particle_number_70nm",
    "dist_particle_number_114nm",
    "dist_particle_number_185nm",
    "dist_particle_number_300nm",
];

/// Partector (first generation), all firmware versions.
pub const P1_LEGACY: Schema = Schema {
    name: "p1_legacy",
    fields: &[
        ("runtime_min", Float),
        ("battery_voltage", Float),
        ("diffusion_current", Float),
        ("corona_voltage", Float),
        ("em_amplitude1", Float),
        ("dac", Float),
        ("hv_on", Int),
        ("diffusion_current_offset", Float),
        ("flow_from_dp", Float),
        ("ldsa", Float),
        ("temperature", Float),
        ("relative_humidity", Float),
        ("device_status", Int),
    ],
};

/// Partector 2, firmware 320 and newer.
pub const P2_V320: Schema = Schema {
    name: "p2_v320",
    fields: &[
        ("runtime_min", Float),
        ("diffusion_current", Float),
        ("corona_voltage", Int),
        ("hires_adc1", Float),
        ("hires_adc2", Float),
        ("em_amplitude1", Float),
        ("em_amplitude2", Float),
        ("temperature", Float),
        ("relative_humidity", Int),
        ("device_status", Int),
        ("deposition_voltage", Int),
        ("battery_voltage", Float),
        ("flow_from_dp", Float),
        ("ldsa", Float),
        ("particle_diameter", Float),
        ("particle_number", Int),
        ("differential_pressure", Int),
        ("ambient_pressure", Float),
        ("em_gain1", Float),
        ("em_gain2", Float),
    ],
};

/// Partector 2, firmware 295, 297 and 298.
pub const P2_V295_V297_V298: Schema = Schema {
    name: "p2_v295_v297_v298",
    fields: &[
        ("runtime_min", Float),
        ("diffusion_current", Float),
        ("corona_voltage", Int),
        ("hires_adc1", Float),
        ("hires_adc2", Float),
        ("em_amplitude1", Float),
        ("em_amplitude2", Float),
        ("temperature", Float),
        ("relative_humidity", Int),
        ("device_status", Int),
        ("deposition_voltage", Int),
        ("battery_voltage", Float),
        ("flow_from_dp", Float),
        ("ldsa", Float),
        ("particle_diameter", Float),
        ("particle_number", Int),
        ("differential_pressure", Int),
        ("ambient_pressure", Float),
    ],
};

/// Partector 2, firmware 265 and 275.
pub const P2_V265_V275: Schema = Schema {
    name: "p2_v265_v275",
    fields: &[
        ("runtime_min", Float),
        ("diffusion_current", Float),
        ("corona_voltage", Int),
        ("hires_adc1", Float),
        ("hires_adc2", Float),
        ("em_amplitude1", Float),
        ("em_amplitude2", Float),
        ("temperature", Float),
        ("relative_humidity", Int),
        ("device_status", Int),
        ("deposition_voltage", Int),
        ("battery_voltage", Float),
        ("flow_from_dp", Float),
        ("ldsa", Float),
        ("particle_diameter", Float),
        ("particle_number", Int),
        ("differential_pressure", Int),
        ("ambient_pressure", Float),
        ("lag", Int),
    ],
};

/// Partector 2 fallback for firmware without a dedicated layout.
pub const P2_LEGACY: Schema = Schema {
    name: "p2_legacy",
    fields: P2_V295_V297_V298.fields,
};

/// Partector 2 Pro in pro mode, firmware 311 to 335.
pub const P2PRO_V311: Schema = Schema {
    name: "p2pro_v311",
    fields: &[
        ("runtime_min", Float),
        ("particle_number", Int),
        ("particle_diameter", Float),
        ("ldsa", Float),
        ("particle_surface", Float),
        ("particle_mass", Float),
        ("sigma", Float),
        ("diffusion_current", Float),
        ("corona_voltage", Int),
        ("deposition_voltage", Int),
        ("temperature", Float),
        ("relative_humidity", Int),
        ("ambient_pressure", Float),
        ("flow_from_dp", Float),
        ("battery_voltage", Float),
        ("pump_current", Float),
        ("device_status", Int),
        ("pump_pwm", Int),
        ("dist_steps", Int),
        ("dist_particle_number_10nm", Int),
        ("dist_particle_number_16nm", Int),
        ("dist_particle_number_26nm", Int),
        ("dist_particle_number_43nm", Int),
        ("dist_particle_number_70nm", Int),
        ("dist_particle_number_114nm", Int),
        ("dist_particle_number_185nm", Int),
        ("dist_particle_number_300nm", Int),
        ("dist_current_0", Float),
        ("dist_current_1", Float),
        ("dist_current_2", Float),
        ("dist_current_3", Float),
        ("dist_current_4", Float),
        ("em_gain1", Float),
        ("em_gain2", Float),
    ],
};

/// Partector 2 Pro in pro mode, firmware 336 and newer.
///
/// Replaces the pump PWM column with the phase angle flow.
pub const P2PRO_V336: Schema = Schema {
    name: "p2pro_v336",
    fields: &[
        ("runtime_min", Float),
        ("particle_number", Int),
        ("particle_diameter", Float),
        ("ldsa", Float),
        ("particle_surface", Float),
        ("particle_mass", Float),
        ("sigma", Float),
        ("diffusion_current", Float),
        ("corona_voltage", Int),
        ("deposition_voltage", Int),
        ("temperature", Float),
        ("relative_humidity", Int),
        ("ambient_pressure", Float),
        ("flow_from_dp", Float),
        ("battery_voltage", Float),
        ("pump_current", Float),
        ("device_status", Int),
        ("flow_from_phase_angle", Float),
        ("dist_steps", Int),
        ("dist_particle_number_10nm", Int),
        ("dist_particle_number_16nm", Int),
        ("dist_particle_number_26nm", Int),
        ("dist_particle_number_43nm", Int),
        ("dist_particle_number_70nm", Int),
        ("dist_particle_number_114nm", Int),
        ("dist_particle_number_185nm", Int),
        ("dist_particle_number_300nm", Int),
        ("dist_current_0", Float),
        ("dist_current_1", Float),
        ("dist_current_2", Float),
        ("dist_current_3", Float),
        ("dist_current_4", Float),
        ("em_gain1", Float),
        ("em_gain2", Float),
    ],
};

/// Partector 2 Pro CS, firmware 315 and newer.
///
/// Same columns as the pro mode layout; `cs_status` is not printed by the
/// instrument but derived from the inline catalyst markers.
pub const P2PRO_CS_V315: Schema = Schema {
    name: "p2pro_cs_v315",
    fields: P2PRO_V311.fields,
};

/// Every known schema.
pub const ALL: [Schema; 8] = [
    P1_LEGACY,
    P2_V320,
    P2_V295_V297_V298,
    P2_V265_V275,
    P2_LEGACY,
    P2PRO_V311,
    P2PRO_V336,
    P2PRO_CS_V315,
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_schema_lengths() {
        assert_eq!(P1_LEGACY.len(), 13);
        assert_eq!(P2_V320.len(), 20);
        assert_eq!(P2_V295_V297_V298.len(), 18);
        assert_eq!(P2_V265_V275.len(), 19);
        assert_eq!(P2PRO_V311.len(), 34);
        assert_eq!(P2PRO_V336.len(), 34);
        assert_eq!(P2PRO_CS_V315.len(), 34);
    }

    #[test]
    fn test_no_duplicate_columns() {
        for schema in ALL {
            let unique: HashSet<_> = schema.fields.iter().map(|(n, _)| *n).collect();
            assert_eq!(unique.len(), schema.len(), "{}", schema.name);
        }
    }

    #[test]
    fn test_size_distribution_columns_are_contiguous() {
        let start = P2PRO_CS_V315
            .position(SIZE_DISTRIBUTION_FIELDS[0])
            .unwrap();
        for (offset, field) in SIZE_DISTRIBUTION_FIELDS.iter().enumerate() {
            assert_eq!(P2PRO_CS_V315.position(field), Some(start + offset));
        }
        assert!(!P2_V320.contains("dist_steps"));
    }
}
