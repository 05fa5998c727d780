//! GATT notification payloads.
//!
//! A connected instrument notifies on three characteristics. Each payload
//! carries a fixed set of little-endian integer fields:
//!
//! | characteristic | length | content |
//! |---|---|---|
//! | `std` | 20 | LDSA, diameter, number, T, RH, status, battery, mass |
//! | `aux` | 20 | ten 16-bit electrometer and flow values |
//! | `size_dist` | 24 | eight 24-bit size bins |
//!
//! Each decoder validates the length before writing anything, so a record
//! is never left half-updated.

use std::fmt;

use crate::data::{DecodeReject, MeasurementRecord};

/// Length of a `std` payload.
pub const STD_LEN: usize = 20;
/// Length of an `aux` payload.
pub const AUX_LEN: usize = 20;
/// Length of a `size_dist` payload.
pub const SIZE_DIST_LEN: usize = 24;

/// Characteristic a notification arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    /// Standard measurement values.
    Std,
    /// Auxiliary electrometer and flow values.
    Aux,
    /// Size distribution bins.
    SizeDist,
}

impl NotificationKind {
    /// All notifying characteristics, in subscription order.
    pub const ALL: [NotificationKind; 3] = [
        NotificationKind::Std,
        NotificationKind::Aux,
        NotificationKind::SizeDist,
    ];

    /// Expected payload length.
    pub fn payload_len(&self) -> usize {
        match self {
            NotificationKind::Std => STD_LEN,
            NotificationKind::Aux => AUX_LEN,
            NotificationKind::SizeDist => SIZE_DIST_LEN,
        }
    }

    /// Decode `data` into `record`, touching only this kind's fields.
    pub fn apply(&self, data: &[u8], record: &mut MeasurementRecord) -> Result<(), DecodeReject> {
        match self {
            NotificationKind::Std => apply_std(data, record),
            NotificationKind::Aux => apply_aux(data, record),
            NotificationKind::SizeDist => apply_size_dist(data, record),
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationKind::Std => write!(f, "std"),
            NotificationKind::Aux => write!(f, "aux"),
            NotificationKind::SizeDist => write!(f, "size_dist"),
        }
    }
}

/// Little-endian unsigned integer of up to four bytes.
#[inline]
pub(crate) fn le_uint(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .rev()
        .fold(0u32, |acc, b| (acc << 8) | u32::from(*b))
}

#[inline]
fn scaled(bytes: &[u8], scale: f64) -> f64 {
    f64::from(le_uint(bytes)) * scale
}

fn check_len(frame: &'static str, data: &[u8], expected: usize) -> Result<(), DecodeReject> {
    if data.len() == expected {
        Ok(())
    } else {
        Err(DecodeReject::InvalidLength {
            frame,
            actual: data.len(),
        })
    }
}

/// Device status assembled from the low word and seven bits of an
/// extension byte.
#[inline]
pub(crate) fn device_status(low: &[u8], extension: u8) -> u32 {
    le_uint(low) | ((u32::from(extension >> 1) & 0x7F) << 16)
}

/// Decode the measurement block shared by `std` notifications.
///
/// `status_ext` is the byte holding the upper status bits.
pub(crate) fn write_std_fields(data: &[u8], status_ext: u8, record: &mut MeasurementRecord) {
    record.set("ldsa", scaled(&data[0..3], 0.01));
    record.set("particle_diameter", le_uint(&data[3..5]));
    record.set("particle_number", le_uint(&data[5..8]));
    record.set("temperature", u32::from(data[8]));
    record.set("relative_humidity", u32::from(data[9]));
    record.set("device_status", device_status(&data[10..12], status_ext));
    record.set("battery_voltage", scaled(&data[12..14], 0.01));
    record.set("particle_mass", scaled(&data[14..18], 0.01));
}

/// Decode a `std` payload.
pub fn apply_std(data: &[u8], record: &mut MeasurementRecord) -> Result<(), DecodeReject> {
    check_len("std", data, STD_LEN)?;
    write_std_fields(data, data[19], record);
    Ok(())
}

/// Decode an `aux` layout from exactly 20 bytes.
pub(crate) fn write_aux_fields(data: &[u8], record: &mut MeasurementRecord) {
    record.set("corona_voltage", le_uint(&data[0..2]));
    record.set("diffusion_current", scaled(&data[2..4], 0.01));
    record.set("deposition_voltage", le_uint(&data[4..6]));
    record.set("flow_from_dp", scaled(&data[6..8], 0.001));
    record.set("ambient_pressure", le_uint(&data[8..10]));
    record.set("em_amplitude1", le_uint(&data[10..12]));
    record.set("em_amplitude2", le_uint(&data[12..14]));
    record.set("em_gain1", le_uint(&data[14..16]));
    record.set("em_gain2", le_uint(&data[16..18]));
    record.set("diffusion_current_offset", scaled(&data[18..20], 0.01));
}

/// Decode an `aux` payload.
pub fn apply_aux(data: &[u8], record: &mut MeasurementRecord) -> Result<(), DecodeReject> {
    check_len("aux", data, AUX_LEN)?;
    write_aux_fields(data, record);
    Ok(())
}

/// Decode a `size_dist` payload.
pub fn apply_size_dist(data: &[u8], record: &mut MeasurementRecord) -> Result<(), DecodeReject> {
    check_len("size_dist", data, SIZE_DIST_LEN)?;
    for (field, bin) in crate::protocol::schema::SIZE_DISTRIBUTION_FIELDS
        .iter()
        .zip(data.chunks_exact(3))
    {
        record.set(*field, le_uint(bin));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ConnectionType, FieldValue};

    fn empty() -> MeasurementRecord {
        MeasurementRecord::new(0, ConnectionType::BleConnected)
    }

    #[test]
    fn test_le_uint() {
        assert_eq!(le_uint(&[0x10, 0x27]), 10_000);
        assert_eq!(le_uint(&[0x01, 0x00, 0x01]), 65_537);
        assert_eq!(le_uint(&[]), 0);
    }

    #[test]
    fn test_std_payload() {
        let mut data = [0u8; STD_LEN];
        data[0..3].copy_from_slice(&[0xE8, 0x03, 0x00]); // 1000 -> 10.00
        data[3..5].copy_from_slice(&[45, 0]);
        data[5..8].copy_from_slice(&[0x10, 0x27, 0x00]);
        data[8] = 23;
        data[9] = 41;
        data[10..12].copy_from_slice(&[0x02, 0x00]);
        data[12..14].copy_from_slice(&[0x9A, 0x01]); // 410 -> 4.10
        data[14..18].copy_from_slice(&[0x64, 0, 0, 0]);
        data[19] = 0b0000_0011;

        let mut record = empty();
        apply_std(&data, &mut record).unwrap();

        assert!((record.get_f64("ldsa").unwrap() - 10.0).abs() < 1e-9);
        assert_eq!(record.get_i64("particle_diameter"), Some(45));
        assert_eq!(record.get_i64("particle_number"), Some(10_000));
        assert_eq!(record.get_i64("temperature"), Some(23));
        assert_eq!(record.get_i64("relative_humidity"), Some(41));
        assert_eq!(record.get_i64("device_status"), Some(2 | (1 << 16)));
        assert!((record.get_f64("battery_voltage").unwrap() - 4.10).abs() < 1e-9);
        assert!((record.get_f64("particle_mass").unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_wrong_length_leaves_record_untouched() {
        let mut record = empty().with("ldsa", 1.0);
        let result = apply_std(&[0u8; 19], &mut record);
        assert_eq!(
            result,
            Err(DecodeReject::InvalidLength {
                frame: "std",
                actual: 19
            })
        );
        assert_eq!(record.get("ldsa"), Some(FieldValue::Float(1.0)));
        assert_eq!(record.field_count(), 2);

        assert!(apply_size_dist(&[0u8; 25], &mut record).is_err());
        assert!(apply_aux(&[0u8; 0], &mut record).is_err());
    }

    #[test]
    fn test_each_kind_updates_only_its_fields() {
        let mut record = empty();
        NotificationKind::Aux
            .apply(&[1u8; AUX_LEN], &mut record)
            .unwrap();
        assert!(record.contains("corona_voltage"));
        assert!(!record.contains("ldsa"));

        let mut bins = [0u8; SIZE_DIST_LEN];
        bins[21..24].copy_from_slice(&[0x05, 0x00, 0x00]);
        NotificationKind::SizeDist.apply(&bins, &mut record).unwrap();
        assert_eq!(record.get_i64("dist_particle_number_300nm"), Some(5));
        assert_eq!(record.get_i64("corona_voltage"), Some(0x0101));
    }
}
