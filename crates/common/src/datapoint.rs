//! Decoded readings

use crate::sensor::Sensor;
use protocol::RawRecord;
use std::sync::Arc;

/// One reading from one sensor, immutable once published
#[derive(Debug, Clone)]
pub struct DataPoint {
    pub sensor_id: u16,
    pub raw_value: u16,
    /// Unix timestamp in seconds, from the logger's clock
    pub timestamp: u64,
    pub signal: Option<u8>,
    pub sensor: Arc<Sensor>,
}

impl DataPoint {
    pub fn from_record(record: &RawRecord, sensor: Arc<Sensor>) -> Self {
        Self {
            sensor_id: record.sensor_id,
            raw_value: record.raw_value,
            timestamp: record.timestamp,
            signal: record.signal,
            sensor,
        }
    }

    /// Reading converted with the sensor's calibration
    pub fn cooked(&self) -> f64 {
        self.sensor.raw_to_cooked(self.raw_value)
    }

    /// Signal strength for text output, `-` when absent
    pub fn signal_text(&self) -> String {
        self.signal
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string())
    }
}
