//! Test utilities for arexx-logger
//!
//! Frame builders and listener doubles shared by the test suites of all
//! crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{encode_records, short_record};
//! use protocol::parse_frame;
//!
//! let frame = encode_records(&[short_record(5, 42, 16)]);
//! let records = parse_frame(&frame);
//! assert_eq!(records[0].sensor_id, 5);
//! ```

use crate::datapoint::DataPoint;
use crate::listener::DataListener;
use crate::sensor::Sensor;
use protocol::{FRAME_SIZE, Frame, RawRecord};
use std::sync::{Arc, Mutex, PoisonError};

/// Build a frame starting with `bytes`, zero padded
pub fn frame_from(bytes: &[u8]) -> Frame {
    let mut frame = [0u8; FRAME_SIZE];
    let len = bytes.len().min(FRAME_SIZE);
    frame[..len].copy_from_slice(&bytes[..len]);
    frame
}

/// Short (9-byte) record as it appears on the wire
pub fn short_record(sensor_id: u16, raw_value: u16, device_time: u32) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(9);
    bytes.push(9);
    bytes.extend_from_slice(&sensor_id.to_le_bytes());
    bytes.extend_from_slice(&raw_value.to_be_bytes());
    bytes.extend_from_slice(&device_time.to_le_bytes());
    bytes
}

/// Long (10-byte) record with signal strength
pub fn long_record(sensor_id: u16, raw_value: u16, device_time: u32, signal: u8) -> Vec<u8> {
    let mut bytes = short_record(sensor_id, raw_value, device_time);
    bytes[0] = 10;
    bytes.push(signal);
    bytes
}

/// Concatenate wire records and terminate them with the end-of-data byte
pub fn encode_records(records: &[Vec<u8>]) -> Frame {
    let mut bytes: Vec<u8> = records.iter().flatten().copied().collect();
    bytes.push(0xff);
    frame_from(&bytes)
}

/// Frame signalling that the logger has nothing buffered
pub fn no_data_frame() -> Frame {
    [0u8; FRAME_SIZE]
}

/// Data point for a guessed sensor
pub fn create_test_point(sensor_id: u16, raw_value: u16) -> DataPoint {
    let record = RawRecord {
        sensor_id,
        raw_value,
        timestamp: 1_600_000_000,
        signal: None,
    };
    DataPoint::from_record(&record, Arc::new(Sensor::guessed(sensor_id)))
}

/// Listener that stores every point it receives
#[derive(Debug)]
pub struct RecordingListener {
    name: String,
    points: Mutex<Vec<Arc<DataPoint>>>,
}

impl RecordingListener {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            points: Mutex::new(Vec::new()),
        }
    }

    pub fn points(&self) -> Vec<Arc<DataPoint>> {
        self.points
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self) -> usize {
        self.points
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl DataListener for RecordingListener {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_new_data(&self, point: Arc<DataPoint>) -> anyhow::Result<()> {
        self.points
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(point);
        Ok(())
    }
}

/// How a [`FailingListener`] misbehaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    Error,
    Panic,
}

/// Listener that fails on every point
#[derive(Debug)]
pub struct FailingListener {
    mode: FailureMode,
}

impl FailingListener {
    pub fn new(mode: FailureMode) -> Self {
        Self { mode }
    }
}

impl DataListener for FailingListener {
    fn name(&self) -> &str {
        "failing"
    }

    fn on_new_data(&self, point: Arc<DataPoint>) -> anyhow::Result<()> {
        match self.mode {
            FailureMode::Error => anyhow::bail!("refusing point from sensor {}", point.sensor_id),
            FailureMode::Panic => panic!("listener panic on sensor {}", point.sensor_id),
        }
    }
}
