//! Per-device measurement aggregate.
//!
//! Fleet managers drain their queues into a [`FleetAggregate`]. Records are
//! keyed by timestamp per serial number, so a second record for the same
//! second replaces the first.

use std::collections::{BTreeMap, HashMap};

use super::identity::DeviceFamily;
use super::measurement::MeasurementRecord;

/// All records collected for one instrument between two uploads.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceBatch {
    /// Instrument serial number.
    pub serial_number: u32,
    /// Instrument family.
    pub device_family: DeviceFamily,
    /// Records in ascending timestamp order.
    pub records: Vec<MeasurementRecord>,
}

#[derive(Debug, Clone)]
struct DeviceSeries {
    family: DeviceFamily,
    records: BTreeMap<i64, MeasurementRecord>,
}

/// Time series of every known instrument, keyed by serial number.
#[derive(Debug, Clone)]
pub struct FleetAggregate {
    devices: HashMap<u32, DeviceSeries>,
    max_records_per_device: usize,
}

impl FleetAggregate {
    /// Create an aggregate keeping at most `max_records_per_device` seconds
    /// per instrument.
    pub fn new(max_records_per_device: usize) -> Self {
        Self {
            devices: HashMap::new(),
            max_records_per_device: max_records_per_device.max(1),
        }
    }

    /// Add a record; an existing record for the same second is replaced.
    ///
    /// Returns the number of old records evicted to respect the cap.
    pub fn insert(
        &mut self,
        serial_number: u32,
        family: DeviceFamily,
        record: MeasurementRecord,
    ) -> usize {
        let series = self
            .devices
            .entry(serial_number)
            .or_insert_with(|| DeviceSeries {
                family,
                records: BTreeMap::new(),
            });
        series.family = family;
        series.records.insert(record.unix_timestamp, record);
        Self::enforce_cap(series, self.max_records_per_device)
    }

    /// Add many records in arrival order.
    pub fn extend<I>(&mut self, serial_number: u32, family: DeviceFamily, records: I) -> usize
    where
        I: IntoIterator<Item = MeasurementRecord>,
    {
        records
            .into_iter()
            .map(|record| self.insert(serial_number, family, record))
            .sum()
    }

    /// Put batches back that could not be delivered.
    ///
    /// Records that arrived after the batch was taken win over restored
    /// ones for the same second.
    pub fn restore(&mut self, batches: Vec<DeviceBatch>) -> usize {
        let mut evicted = 0;
        for batch in batches {
            let series = self
                .devices
                .entry(batch.serial_number)
                .or_insert_with(|| DeviceSeries {
                    family: batch.device_family,
                    records: BTreeMap::new(),
                });
            for record in batch.records {
                series
                    .records
                    .entry(record.unix_timestamp)
                    .or_insert(record);
            }
            evicted += Self::enforce_cap(series, self.max_records_per_device);
        }
        evicted
    }

    /// Merge another aggregate into this one; `other` wins on equal seconds.
    pub fn merge(&mut self, other: FleetAggregate) -> usize {
        let mut evicted = 0;
        for (serial_number, series) in other.devices {
            evicted += self.extend(serial_number, series.family, series.records.into_values());
        }
        evicted
    }

    /// Remove and return everything, one batch per instrument, ordered by
    /// serial number.
    pub fn take_batches(&mut self) -> Vec<DeviceBatch> {
        let mut batches: Vec<DeviceBatch> = self
            .devices
            .drain()
            .filter(|(_, series)| !series.records.is_empty())
            .map(|(serial_number, series)| DeviceBatch {
                serial_number,
                device_family: series.family,
                records: series.records.into_values().collect(),
            })
            .collect();
        batches.sort_by_key(|b| b.serial_number);
        batches
    }

    /// Serial numbers with at least one record.
    pub fn serial_numbers(&self) -> Vec<u32> {
        let mut serials: Vec<u32> = self
            .devices
            .iter()
            .filter(|(_, s)| !s.records.is_empty())
            .map(|(serial, _)| *serial)
            .collect();
        serials.sort_unstable();
        serials
    }

    /// Records held for one instrument.
    pub fn records_for(&self, serial_number: u32) -> usize {
        self.devices
            .get(&serial_number)
            .map_or(0, |s| s.records.len())
    }

    /// Total number of records held.
    pub fn len(&self) -> usize {
        self.devices.values().map(|s| s.records.len()).sum()
    }

    /// Whether no records are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn enforce_cap(series: &mut DeviceSeries, cap: usize) -> usize {
        let mut evicted = 0;
        while series.records.len() > cap {
            series.records.pop_first();
            evicted += 1;
        }
        evicted
    }
}

impl Default for FleetAggregate {
    fn default() -> Self {
        Self::new(3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ConnectionType;
    use pretty_assertions::assert_eq;

    fn record(ts: i64, ldsa: f64) -> MeasurementRecord {
        MeasurementRecord::new(ts, ConnectionType::Serial).with("ldsa", ldsa)
    }

    #[test]
    fn test_duplicate_timestamp_last_wins() {
        let mut agg = FleetAggregate::new(10);
        agg.insert(8112, DeviceFamily::P2, record(100, 1.0));
        agg.insert(8112, DeviceFamily::P2, record(100, 2.0));

        let batches = agg.take_batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].records.len(), 1);
        assert_eq!(batches[0].records[0].get_f64("ldsa"), Some(2.0));
        assert!(agg.is_empty());
    }

    #[test]
    fn test_batches_are_sorted() {
        let mut agg = FleetAggregate::new(10);
        agg.insert(9000, DeviceFamily::P2Pro, record(102, 1.0));
        agg.insert(8112, DeviceFamily::P2, record(101, 1.0));
        agg.insert(8112, DeviceFamily::P2, record(100, 1.0));

        let batches = agg.take_batches();
        let serials: Vec<u32> = batches.iter().map(|b| b.serial_number).collect();
        assert_eq!(serials, vec![8112, 9000]);
        let stamps: Vec<i64> = batches[0].records.iter().map(|r| r.unix_timestamp).collect();
        assert_eq!(stamps, vec![100, 101]);
    }

    #[test]
    fn test_cap_evicts_oldest() {
        let mut agg = FleetAggregate::new(3);
        let evicted = agg.extend(1, DeviceFamily::P1, (0..5).map(|ts| record(ts, 0.0)));
        assert_eq!(evicted, 2);
        assert_eq!(agg.records_for(1), 3);

        let batch = agg.take_batches().remove(0);
        assert_eq!(batch.records.first().map(|r| r.unix_timestamp), Some(2));
    }

    #[test]
    fn test_restore_does_not_override_newer_records() {
        let mut agg = FleetAggregate::new(10);
        agg.insert(1, DeviceFamily::P2, record(100, 1.0));
        let taken = agg.take_batches();

        agg.insert(1, DeviceFamily::P2, record(100, 5.0));
        agg.insert(1, DeviceFamily::P2, record(101, 6.0));
        agg.restore(taken);

        let batch = agg.take_batches().remove(0);
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.records[0].get_f64("ldsa"), Some(5.0));
    }

    #[test]
    fn test_merge() {
        let mut a = FleetAggregate::new(10);
        a.insert(1, DeviceFamily::P2, record(100, 1.0));
        let mut b = FleetAggregate::new(10);
        b.insert(1, DeviceFamily::P2, record(100, 3.0));
        b.insert(2, DeviceFamily::P2, record(100, 4.0));

        a.merge(b);
        assert_eq!(a.serial_numbers(), vec![1, 2]);
        assert_eq!(a.len(), 2);
        let batches = a.take_batches();
        assert_eq!(batches[0].records[0].get_f64("ldsa"), Some(3.0));
    }
}
