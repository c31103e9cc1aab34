//! Common types for arexx-logger
//!
//! This crate holds everything between the wire codec and the USB layer:
//! the sensor model and registry with calibration, decoded data points,
//! the listener fan-out used to distribute readings to output sinks,
//! the shared error type and logging setup.

pub mod datapoint;
pub mod error;
pub mod listener;
pub mod logging;
pub mod registry;
pub mod sensor;
pub mod test_utils;

pub use datapoint::DataPoint;
pub use error::{Error, Result};
pub use listener::{DataListener, ListenerSet};
pub use logging::setup_logging;
pub use registry::SensorRegistry;
pub use sensor::{Calibration, Sensor, SensorKind};
