//! Advertisement frame decoding.
//!
//! Instruments put their current measurement into the manufacturer data of
//! every advertisement. The two byte "manufacturer id" is part of the frame:
//! the id in big-endian order followed by the payload gives 22 or 44 bytes.
//!
//! | bytes | field |
//! |---|---|
//! | 0 | `'X'` |
//! | 1 | header `0x58` |
//! | 2..5 | LDSA ×0.01 |
//! | 5..7 | diameter |
//! | 7..10 | number |
//! | 10 | temperature |
//! | 11 | relative humidity |
//! | 12..14 | status, low 16 bits |
//! | 14..16 | serial number |
//! | 16..18 | battery voltage ×0.01 |
//! | 18..21 | particle mass ×0.01 |
//! | 21 | status, bits 1..7 are status bits 16..22 |
//! | 22..42 | (44 byte frames) auxiliary block, same layout as the `aux` notification |

use std::collections::HashMap;

use bytes::Bytes;

use super::notifications::{device_status, le_uint, write_aux_fields, AUX_LEN};
use crate::data::{ConnectionType, DecodeReject, MeasurementRecord};

/// Frame lengths an instrument sends.
pub const VALID_LENGTHS: [usize; 2] = [22, 44];

/// Value of byte 1 in every valid frame.
pub const HEADER_BYTE: u8 = 0x58;

const SHORT_LEN: usize = 22;

/// A validated advertisement frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementFrame {
    /// Serial number of the sender.
    pub serial_number: u32,
    raw: Bytes,
}

impl AdvertisementFrame {
    /// The frame bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// Whether the frame carries the auxiliary block.
    pub fn is_extended(&self) -> bool {
        self.raw.len() > SHORT_LEN
    }

    /// Decode the measurement carried by the frame.
    pub fn to_record(&self, unix_timestamp: i64) -> MeasurementRecord {
        let b = &self.raw[..];
        let mut record = MeasurementRecord::new(unix_timestamp, ConnectionType::BleAdvertisement);

        record.set("ldsa", f64::from(le_uint(&b[2..5])) * 0.01);
        record.set("particle_diameter", le_uint(&b[5..7]));
        record.set("particle_number", le_uint(&b[7..10]));
        record.set("temperature", u32::from(b[10]));
        record.set("relative_humidity", u32::from(b[11]));
        record.set("device_status", device_status(&b[12..14], b[21]));
        record.set("battery_voltage", f64::from(le_uint(&b[16..18])) * 0.01);
        record.set("particle_mass", f64::from(le_uint(&b[18..21])) * 0.01);

        if self.is_extended() {
            write_aux_fields(&b[SHORT_LEN..SHORT_LEN + AUX_LEN], &mut record);
        }
        record
    }
}

/// Check length and header of a frame.
pub fn validate(buf: &[u8]) -> Result<(), DecodeReject> {
    if !VALID_LENGTHS.contains(&buf.len()) {
        return Err(DecodeReject::InvalidLength {
            frame: "advertisement",
            actual: buf.len(),
        });
    }
    if buf[1] != HEADER_BYTE {
        return Err(DecodeReject::BadHeader { actual: buf[1] });
    }
    Ok(())
}

/// Decode a frame; `None` if it is not an instrument frame.
///
/// # Example
///
/// ```
/// use naneos_devices::protocol::advertisement::decode;
///
/// let mut frame = vec![b'X', 0x58];
/// frame.extend_from_slice(&[0u8; 20]);
/// frame[14] = 0x10;
/// frame[15] = 0x27;
/// assert_eq!(decode(&frame).map(|f| f.serial_number), Some(10_000));
///
/// frame.pop();
/// assert!(decode(&frame).is_none());
/// ```
pub fn decode(buf: &[u8]) -> Option<AdvertisementFrame> {
    validate(buf).ok()?;
    Some(AdvertisementFrame {
        serial_number: le_uint(&buf[14..16]),
        raw: Bytes::copy_from_slice(buf),
    })
}

/// Rebuild the frame from a manufacturer id and its payload.
pub fn frame_bytes(manufacturer_id: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(2 + payload.len());
    frame.extend_from_slice(&manufacturer_id.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Rebuild the frame from advertised manufacturer data.
///
/// Instruments advertise a single manufacturer entry; with several entries
/// the lowest id is used so the choice is stable.
pub fn frame_from_manufacturer_data(data: &HashMap<u16, Vec<u8>>) -> Option<Vec<u8>> {
    data.iter()
        .min_by_key(|(id, _)| **id)
        .map(|(id, payload)| frame_bytes(*id, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_frame(len: usize) -> Vec<u8> {
        let mut frame = vec![0u8; len];
        frame[0] = b'X';
        frame[1] = HEADER_BYTE;
        frame[2..5].copy_from_slice(&[0xC4, 0x09, 0x00]); // 2500 -> 25.00
        frame[5..7].copy_from_slice(&[40, 0]);
        frame[7..10].copy_from_slice(&[0x88, 0x13, 0x00]); // 5000
        frame[10] = 22;
        frame[11] = 45;
        frame[14..16].copy_from_slice(&[0xB0, 0x1F]); // 8112
        frame[16..18].copy_from_slice(&[0x9A, 0x01]);
        frame
    }

    #[test]
    fn test_serial_number_from_spec_frame() {
        let mut frame = b"X\x58".to_vec();
        frame.extend_from_slice(&[0u8; 20]);
        frame[14] = 0x10;
        frame[15] = 0x27;
        assert_eq!(decode(&frame).unwrap().serial_number, 10_000);

        let mut short = frame.clone();
        short.pop();
        assert!(decode(&short).is_none());
        let mut long = frame.clone();
        long.push(0);
        assert!(decode(&long).is_none());
    }

    #[test]
    fn test_bad_header() {
        let mut frame = sample_frame(22);
        frame[1] = 0x59;
        assert_eq!(validate(&frame), Err(DecodeReject::BadHeader { actual: 0x59 }));
    }

    #[test]
    fn test_record_fields() {
        let frame = decode(&sample_frame(22)).unwrap();
        assert_eq!(frame.serial_number, 8112);
        assert!(!frame.is_extended());

        let record = frame.to_record(1_700_000_000);
        assert_eq!(record.connection_type, ConnectionType::BleAdvertisement);
        assert!((record.get_f64("ldsa").unwrap() - 25.0).abs() < 1e-9);
        assert_eq!(record.get_i64("particle_number"), Some(5000));
        assert_eq!(record.get_i64("temperature"), Some(22));
        assert_eq!(record.get_i64("relative_humidity"), Some(45));
        assert!(!record.contains("corona_voltage"));
    }

    #[test]
    fn test_extended_frame_carries_aux_block() {
        let mut raw = sample_frame(44);
        raw[22..24].copy_from_slice(&[0x34, 0x08]); // 2100 V
        let record = decode(&raw).unwrap().to_record(0);
        assert_eq!(record.get_i64("corona_voltage"), Some(2100));
    }

    #[test]
    fn test_frame_from_manufacturer_data() {
        let mut data = HashMap::new();
        data.insert(0x5858u16, vec![1, 2, 3]);
        assert_eq!(
            frame_from_manufacturer_data(&data),
            Some(vec![0x58, 0x58, 1, 2, 3])
        );
        assert_eq!(frame_from_manufacturer_data(&HashMap::new()), None);
    }

    proptest! {
        #[test]
        fn prop_decode_accepts_only_valid_frames(buf in proptest::collection::vec(any::<u8>(), 0..64)) {
            let valid = VALID_LENGTHS.contains(&buf.len()) && buf[1] == HEADER_BYTE;
            match decode(&buf) {
                Some(frame) => {
                    prop_assert!(valid);
                    prop_assert_eq!(frame.serial_number, u32::from(u16::from_le_bytes([buf[14], buf[15]])));
                }
                None => prop_assert!(!valid),
            }
        }

        #[test]
        fn prop_valid_frames_always_decode(mut body in proptest::collection::vec(any::<u8>(), 22), extended in any::<bool>()) {
            body[1] = HEADER_BYTE;
            if extended {
                body.extend_from_slice(&[0u8; 22]);
            }
            prop_assert!(decode(&body).is_some());
        }
    }
}
