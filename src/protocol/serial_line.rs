//! Serial telemetry line decoding.
//!
//! A telemetry line is a run of tab-separated ASCII columns terminated by
//! CRLF. Lines whose width matches the active [`Schema`] become measurement
//! records; anything else is most likely the answer to a command and is
//! handed back as raw columns.
//!
//! P2 Pro CS instruments additionally prefix some lines with `CS_on` or
//! `CS_off` (optionally preceded by `!`). The [`CatalystTracker`] strips the
//! marker, remembers the last state and stamps it onto every record.

use super::schema::{FieldType, Schema, SIZE_DISTRIBUTION_FIELDS};
use crate::data::{CatalystState, ConnectionType, DecodeReject, FieldValue, MeasurementRecord};

/// Field name of the catalyst state.
pub const CS_STATUS_FIELD: &str = "cs_status";

const CATALYST_MARKERS: [(&str, CatalystState); 4] = [
    ("!CS_on", CatalystState::On),
    ("!CS_off", CatalystState::Off),
    ("CS_on", CatalystState::On),
    ("CS_off", CatalystState::Off),
];

/// Strip line terminators and NUL padding, and check the line is ASCII.
pub fn clean_line(raw: &[u8]) -> Result<String, DecodeReject> {
    if !raw.is_ascii() {
        return Err(DecodeReject::NotAscii);
    }
    let line: String = raw
        .iter()
        .filter(|b| !matches!(**b, b'\r' | b'\n' | 0))
        .map(|b| *b as char)
        .collect();
    if line.is_empty() {
        return Err(DecodeReject::Empty);
    }
    Ok(line)
}

/// Split a cleaned line into its columns.
pub fn split_columns(line: &str) -> Vec<&str> {
    line.split('\t').collect()
}

/// Parse columns against a schema.
///
/// The column count must equal the schema length, and every column must
/// parse as its declared type. Either failure rejects the whole line.
///
/// # Example
///
/// ```
/// use naneos_devices::data::ConnectionType;
/// use naneos_devices::protocol::schema::P1_LEGACY;
/// use naneos_devices::protocol::serial_line::decode_columns;
///
/// let line = "12.5\t8.1\t0.4\t2100\t0.2\t3.1\t1\t0.01\t1.2\t55.2\t24.1\t40\t0";
/// let cols: Vec<&str> = line.split('\t').collect();
/// let record = decode_columns(&P1_LEGACY, &cols, 1_700_000_000, ConnectionType::Serial).unwrap();
/// assert_eq!(record.field_count(), P1_LEGACY.len() + 1);
/// ```
pub fn decode_columns(
    schema: &Schema,
    columns: &[&str],
    unix_timestamp: i64,
    connection_type: ConnectionType,
) -> Result<MeasurementRecord, DecodeReject> {
    if columns.len() != schema.len() {
        return Err(DecodeReject::ColumnCount {
            expected: schema.len(),
            actual: columns.len(),
        });
    }

    let mut record = MeasurementRecord::new(unix_timestamp, connection_type);
    for ((name, field_type), raw) in schema.fields.iter().zip(columns) {
        record.set(*name, parse_value(*name, *field_type, raw)?);
    }
    Ok(record)
}

fn parse_value(
    name: &'static str,
    field_type: FieldType,
    raw: &str,
) -> Result<FieldValue, DecodeReject> {
    let text = raw.trim();
    let invalid = || DecodeReject::InvalidNumber {
        field: name,
        value: raw.to_string(),
    };
    match field_type {
        FieldType::Int => text.parse::<i64>().map(FieldValue::Int).map_err(|_| invalid()),
        FieldType::Float => text
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(FieldValue::Float)
            .ok_or_else(invalid),
    }
}

/// Sticky catalyst state of one serial connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct CatalystTracker {
    state: CatalystState,
}

impl CatalystTracker {
    /// Create a tracker in the [`CatalystState::Unknown`] state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn state(&self) -> CatalystState {
        self.state
    }

    /// Remove a catalyst marker from `line` and update the state.
    ///
    /// Returns the line without the marker and the marker found, if any.
    pub fn strip(&mut self, line: &str) -> (String, Option<CatalystState>) {
        for (marker, state) in CATALYST_MARKERS {
            if line.contains(marker) {
                self.state = state;
                return (line.replacen(marker, "", 1), Some(state));
            }
        }
        (line.to_string(), None)
    }

    /// Stamp the state onto a decoded record; `cs_status` is always set,
    /// -1 while no marker has been seen.
    ///
    /// Without a fresh marker on the line the size distribution is not
    /// valid and its columns are zeroed.
    pub fn apply(&self, record: &mut MeasurementRecord, marker_present: bool) {
        if !marker_present {
            for field in SIZE_DISTRIBUTION_FIELDS {
                if record.contains(field) {
                    record.set(field, 0i64);
                }
            }
        }
        record.set(CS_STATUS_FIELD, self.state.cs_status());
    }
}

/// Outcome of decoding one serial line.
#[derive(Debug, Clone, PartialEq)]
pub enum LineDecode {
    /// A telemetry record.
    Measurement(MeasurementRecord),
    /// The width does not match the schema; probably a command response.
    Response {
        /// Raw columns.
        columns: Vec<String>,
        /// Why it is not a measurement.
        reject: DecodeReject,
    },
    /// The line has the right width but is malformed, or is not text.
    Rejected(DecodeReject),
}

/// Decoded line plus any catalyst transition it carried.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedLine {
    /// What the line turned out to be.
    pub outcome: LineDecode,
    /// New catalyst state if this line changed it.
    pub catalyst_changed: Option<CatalystState>,
}

/// Stateful decoder for one serial connection.
#[derive(Debug, Clone)]
pub struct LineDecoder {
    schema: Schema,
    catalyst: Option<CatalystTracker>,
}

impl LineDecoder {
    /// Decoder for `schema`; `tracks_catalyst` enables marker handling.
    pub fn new(schema: Schema, tracks_catalyst: bool) -> Self {
        Self {
            schema,
            catalyst: tracks_catalyst.then(CatalystTracker::new),
        }
    }

    /// Active schema.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Current catalyst state; `Unknown` when not tracked.
    pub fn catalyst_state(&self) -> CatalystState {
        self.catalyst
            .as_ref()
            .map_or(CatalystState::Unknown, |c| c.state())
    }

    /// Decode one raw line received at `unix_timestamp`.
    pub fn decode(&mut self, raw: &[u8], unix_timestamp: i64) -> DecodedLine {
        let line = match clean_line(raw) {
            Ok(line) => line,
            Err(reject) => {
                return DecodedLine {
                    outcome: LineDecode::Rejected(reject),
                    catalyst_changed: None,
                }
            }
        };

        let previous = self.catalyst_state();
        let (line, marker) = match self.catalyst.as_mut() {
            Some(tracker) => tracker.strip(&line),
            None => (line, None),
        };
        let catalyst_changed = marker.filter(|state| *state != previous);

        let columns = split_columns(&line);
        let outcome = match decode_columns(&self.schema, &columns, unix_timestamp, ConnectionType::Serial)
        {
            Ok(mut record) => {
                if let Some(tracker) = &self.catalyst {
                    tracker.apply(&mut record, marker.is_some());
                }
                LineDecode::Measurement(record)
            }
            Err(reject @ DecodeReject::ColumnCount { .. }) => LineDecode::Response {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                reject,
            },
            Err(reject) => LineDecode::Rejected(reject),
        };

        DecodedLine {
            outcome,
            catalyst_changed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::schema::{P2PRO_CS_V315, P2_V320};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    const FIVE: Schema = Schema {
        name: "five",
        fields: &[
            ("a", FieldType::Int),
            ("b", FieldType::Int),
            ("c", FieldType::Float),
            ("d", FieldType::Int),
            ("e", FieldType::Float),
        ],
    };

    fn cs_line(dist_value: i64) -> String {
        P2PRO_CS_V315
            .fields
            .iter()
            .map(|(name, ty)| match (*name, ty) {
                (n, _) if n.starts_with("dist_particle_number") => dist_value.to_string(),
                (_, FieldType::Int) => "1".to_string(),
                (_, FieldType::Float) => "1.5".to_string(),
            })
            .collect::<Vec<_>>()
            .join("\t")
    }

    #[test]
    fn test_clean_line() {
        assert_eq!(clean_line(b"8112\r\n\0").unwrap(), "8112");
        assert_eq!(clean_line(b"\r\n"), Err(DecodeReject::Empty));
        assert_eq!(clean_line(&[0xC3, 0xA9]), Err(DecodeReject::NotAscii));
    }

    #[test]
    fn test_short_line_goes_to_diagnostics() {
        let mut decoder = LineDecoder::new(FIVE, false);
        let decoded = decoder.decode(b"5\t12\t34\t0\r\n", 100);
        assert_eq!(
            decoded.outcome,
            LineDecode::Response {
                columns: vec!["5".into(), "12".into(), "34".into(), "0".into()],
                reject: DecodeReject::ColumnCount {
                    expected: 5,
                    actual: 4
                },
            }
        );
    }

    #[test]
    fn test_bad_number_rejects_whole_line() {
        let mut decoder = LineDecoder::new(FIVE, false);
        let decoded = decoder.decode(b"5\t12\tx\t0\t1.0\r\n", 100);
        assert_eq!(
            decoded.outcome,
            LineDecode::Rejected(DecodeReject::InvalidNumber {
                field: "c",
                value: "x".into()
            })
        );

        // An integer column does not accept a float.
        let decoded = decoder.decode(b"5.5\t12\t1\t0\t1.0", 100);
        assert!(matches!(decoded.outcome, LineDecode::Rejected(_)));
    }

    #[test]
    fn test_record_types_follow_schema() {
        let mut decoder = LineDecoder::new(FIVE, false);
        let decoded = decoder.decode(b"5\t12\t34\t0\t2.5\r\n", 1_700_000_000);
        let LineDecode::Measurement(record) = decoded.outcome else {
            panic!("expected a measurement");
        };
        assert_eq!(record.unix_timestamp, 1_700_000_000);
        assert_eq!(record.field_count(), 6);
        assert_eq!(record.get("a"), Some(FieldValue::Int(5)));
        assert_eq!(record.get("c"), Some(FieldValue::Float(34.0)));
        assert_eq!(record.get("e"), Some(FieldValue::Float(2.5)));
    }

    #[test]
    fn test_catalyst_marker_is_sticky() {
        let mut decoder = LineDecoder::new(P2PRO_CS_V315, true);

        let first = decoder.decode(format!("{}\r\n", cs_line(7)).as_bytes(), 1);
        let LineDecode::Measurement(record) = first.outcome else {
            panic!("expected a measurement");
        };
        // Unknown until the first marker, but still reported.
        assert_eq!(record.get_i64(CS_STATUS_FIELD), Some(-1));
        assert_eq!(record.get_i64("dist_particle_number_10nm"), Some(0));
        assert_eq!(first.catalyst_changed, None);

        let on = decoder.decode(format!("!CS_on{}\r\n", cs_line(7)).as_bytes(), 2);
        assert_eq!(on.catalyst_changed, Some(CatalystState::On));
        let LineDecode::Measurement(record) = on.outcome else {
            panic!("expected a measurement");
        };
        assert_eq!(record.get_i64(CS_STATUS_FIELD), Some(1));
        assert_eq!(record.get_i64("dist_particle_number_300nm"), Some(7));

        let plain = decoder.decode(cs_line(7).as_bytes(), 3);
        assert_eq!(plain.catalyst_changed, None);
        let LineDecode::Measurement(record) = plain.outcome else {
            panic!("expected a measurement");
        };
        assert_eq!(record.get_i64(CS_STATUS_FIELD), Some(1));
        assert_eq!(record.get_i64("dist_particle_number_43nm"), Some(0));

        let off = decoder.decode(format!("CS_off{}", cs_line(3)).as_bytes(), 4);
        assert_eq!(off.catalyst_changed, Some(CatalystState::Off));
        assert_eq!(decoder.catalyst_state(), CatalystState::Off);
    }

    #[test]
    fn test_markers_ignored_without_tracking() {
        let mut decoder = LineDecoder::new(P2_V320, false);
        let decoded = decoder.decode(b"CS_on\t1", 1);
        assert!(matches!(decoded.outcome, LineDecode::Response { .. }));
        assert_eq!(decoded.catalyst_changed, None);
    }

    proptest! {
        #[test]
        fn prop_matching_width_yields_n_plus_one_fields(
            values in proptest::collection::vec(-1_000_000i64..1_000_000, 20)
        ) {
            let mut decoder = LineDecoder::new(P2_V320, false);
            let line = values.iter().map(|v| v.to_string()).collect::<Vec<_>>().join("\t");
            let decoded = decoder.decode(line.as_bytes(), 42);
            match decoded.outcome {
                LineDecode::Measurement(record) => {
                    prop_assert_eq!(record.field_count(), P2_V320.len() + 1);
                    for (name, ty) in P2_V320.fields {
                        prop_assert_eq!(record.get(name).map(|v| v.is_int()), Some(*ty == FieldType::Int));
                    }
                }
                other => prop_assert!(false, "unexpected {:?}", other),
            }
        }

        #[test]
        fn prop_wrong_width_never_yields_measurement(width in 0usize..40) {
            prop_assume!(width != P2_V320.len());
            let mut decoder = LineDecoder::new(P2_V320, false);
            let line = vec!["1"; width.max(1)].join("\t");
            prop_assume!(width.max(1) != P2_V320.len());
            let decoded = decoder.decode(line.as_bytes(), 42);
            prop_assert!(!matches!(decoded.outcome, LineDecode::Measurement(_)));
        }
    }
}
