//! Shared sensor-value table.
//!
//! Single writer (the tick thread) per record, many readers (alarm
//! engine, fieldbus adapter, diagnostics). Each record sits behind its
//! own lock, so a reader observes either the previous complete reading
//! or the new one, never a torn mix. Publish enforces monotonic
//! timestamps per sensor.
//!
//! The record population is fixed at construction; sensor create/delete
//! rebuilds the table outside the tick.

use std::collections::HashMap;
use std::sync::Mutex;

use wt_common::error::{RtuError, RtuResult};
use wt_common::model::Reading;

/// The shared value table.
pub struct SensorValueTable {
    records: HashMap<u32, Mutex<Option<Reading>>>,
}

impl SensorValueTable {
    /// Build a table for the given sensor ids.
    pub fn new(sensor_ids: impl IntoIterator<Item = u32>) -> Self {
        Self {
            records: sensor_ids
                .into_iter()
                .map(|id| (id, Mutex::new(None)))
                .collect(),
        }
    }

    /// Publish a reading. Rejects unknown sensors and non-monotonic
    /// timestamps.
    pub fn publish(&self, sensor_id: u32, reading: Reading) -> RtuResult<()> {
        let slot = self
            .records
            .get(&sensor_id)
            .ok_or_else(|| RtuError::NotFound(format!("sensor id {sensor_id}")))?;
        let mut record = slot.lock().expect("value table lock poisoned");
        if let Some(prev) = *record {
            if reading.ts_ms < prev.ts_ms {
                return Err(RtuError::InvalidState(format!(
                    "sensor {sensor_id}: publish timestamp {} before {}",
                    reading.ts_ms, prev.ts_ms
                )));
            }
        }
        *record = Some(reading);
        Ok(())
    }

    /// Latest reading of one sensor.
    pub fn get(&self, sensor_id: u32) -> Option<Reading> {
        self.records
            .get(&sensor_id)?
            .lock()
            .expect("value table lock poisoned")
            .as_ref()
            .copied()
    }

    /// Consistent per-record snapshot of the whole table.
    ///
    /// Records are sampled one by one: each sensor contributes either
    /// its previous or its new reading, never a partial write. This is
    /// the view the alarm engine evaluates and the fieldbus publishes.
    pub fn snapshot(&self) -> HashMap<u32, Reading> {
        self.records
            .iter()
            .filter_map(|(id, slot)| {
                slot.lock()
                    .expect("value table lock poisoned")
                    .map(|r| (*id, r))
            })
            .collect()
    }

    /// Number of sensors in the table.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the table holds no sensors.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wt_common::model::SensorStatus;

    fn reading(value: f32, ts_ms: u64) -> Reading {
        Reading {
            value,
            status: SensorStatus::Ok,
            ts_ms,
        }
    }

    #[test]
    fn publish_and_get() {
        let table = SensorValueTable::new([1, 2]);
        assert!(table.get(1).is_none());

        table.publish(1, reading(7.0, 100)).unwrap();
        assert_eq!(table.get(1).unwrap().value, 7.0);
        assert!(table.get(2).is_none());
    }

    #[test]
    fn unknown_sensor_rejected() {
        let table = SensorValueTable::new([1]);
        assert!(matches!(
            table.publish(99, reading(0.0, 1)),
            Err(RtuError::NotFound(_))
        ));
    }

    #[test]
    fn timestamps_must_be_monotonic() {
        let table = SensorValueTable::new([1]);
        table.publish(1, reading(1.0, 100)).unwrap();
        table.publish(1, reading(2.0, 100)).unwrap(); // equal is fine
        table.publish(1, reading(3.0, 150)).unwrap();

        assert!(matches!(
            table.publish(1, reading(4.0, 149)),
            Err(RtuError::InvalidState(_))
        ));
        // The rejected publish left the record untouched.
        assert_eq!(table.get(1).unwrap().value, 3.0);
    }

    #[test]
    fn snapshot_contains_only_published_sensors() {
        let table = SensorValueTable::new([1, 2, 3]);
        table.publish(1, reading(1.0, 10)).unwrap();
        table.publish(3, reading(3.0, 10)).unwrap();

        let snap = table.snapshot();
        assert_eq!(snap.len(), 2);
        assert!(snap.contains_key(&1));
        assert!(!snap.contains_key(&2));
    }

    #[test]
    fn concurrent_readers_never_see_torn_records() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};

        let table = Arc::new(SensorValueTable::new([1]));
        let stop = Arc::new(AtomicBool::new(false));

        let reader = {
            let table = Arc::clone(&table);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    if let Some(r) = table.get(1) {
                        // Writer keeps value == ts_ms as f32; a torn read
                        // would break the pairing.
                        assert_eq!(r.value, r.ts_ms as f32);
                    }
                }
            })
        };

        for ts in 0..10_000u64 {
            table
                .publish(
                    1,
                    Reading {
                        value: ts as f32,
                        status: SensorStatus::Ok,
                        ts_ms: ts,
                    },
                )
                .unwrap();
        }
        stop.store(true, Ordering::Relaxed);
        reader.join().unwrap();
    }
}
