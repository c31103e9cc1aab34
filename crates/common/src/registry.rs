//! Sensor registry
//!
//! Owns every [`Sensor`] known to the process. Sensors are defined from the
//! configuration before polling starts and are shared read-only with data
//! points afterwards through `Arc`.

use crate::datapoint::DataPoint;
use crate::error::{Error, Result};
use crate::sensor::{COMBINED_MODELS, Sensor, SensorKind, TEMPERATURE_MODELS};
use protocol::RawRecord;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Registry of logical sensors keyed by protocol address
#[derive(Debug)]
pub struct SensorRegistry {
    sensors: BTreeMap<u16, Arc<Sensor>>,
    detect_unknown: bool,
}

impl Default for SensorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorRegistry {
    /// Create an empty registry with unknown-sensor detection enabled
    pub fn new() -> Self {
        Self {
            sensors: BTreeMap::new(),
            detect_unknown: true,
        }
    }

    pub fn set_detect_unknown(&mut self, detect: bool) {
        self.detect_unknown = detect;
    }

    pub fn detect_unknown(&self) -> bool {
        self.detect_unknown
    }

    /// Look up a sensor, creating a guessed one when detection is enabled
    pub fn resolve(&mut self, id: u16) -> Result<Arc<Sensor>> {
        if let Some(sensor) = self.sensors.get(&id) {
            return Ok(Arc::clone(sensor));
        }

        if !self.detect_unknown {
            return Err(Error::UnknownSensor(id));
        }

        let sensor = Arc::new(Sensor::guessed(id));
        info!("Adding guessed {} sensor {}", sensor.kind(), id);
        self.sensors.insert(id, Arc::clone(&sensor));
        Ok(sensor)
    }

    /// Define (or redefine) a sensor
    pub fn define(
        &mut self,
        id: u16,
        kind: SensorKind,
        model: &str,
        name: &str,
    ) -> Arc<Sensor> {
        let sensor = Arc::new(Sensor::new(id, kind, model, name));
        debug!("Defined sensor {} ({} {}, {})", id, model, kind, name);
        self.sensors.insert(id, Arc::clone(&sensor));
        sensor
    }

    /// Define the sensors for one configured device model
    ///
    /// Combined temperature/humidity models register `id` as temperature and
    /// `id + 1` as humidity under the same name. Unrecognised models get the
    /// parity heuristic. Returns the ids that were defined.
    pub fn define_model(&mut self, id: u16, model: &str, name: &str) -> Result<Vec<u16>> {
        if COMBINED_MODELS.contains(&model) {
            let humidity_id = id.checked_add(1).ok_or_else(|| {
                Error::Configuration(format!(
                    "Sensor {} of model {} needs a humidity channel at id {}",
                    id,
                    model,
                    u32::from(id) + 1
                ))
            })?;
            self.define(id, SensorKind::Temperature, model, name);
            self.define(humidity_id, SensorKind::Humidity, model, name);
            return Ok(vec![id, humidity_id]);
        }

        let kind = if TEMPERATURE_MODELS.contains(&model) {
            SensorKind::Temperature
        } else {
            SensorKind::from_parity(id)
        };
        self.define(id, kind, model, name);
        Ok(vec![id])
    }

    /// Set one calibration coefficient of a defined sensor
    ///
    /// Meant for configuration time. If data points already hold the sensor,
    /// they keep the previous calibration.
    pub fn set_calibration(&mut self, id: u16, order: u32, coefficient: f64) -> Result<()> {
        let sensor = self.sensors.get_mut(&id).ok_or(Error::UnknownSensor(id))?;
        Arc::make_mut(sensor).set_calibration(order, coefficient);
        debug!(
            "Calibration value for sensor {} order {} value {}",
            id, order, coefficient
        );
        Ok(())
    }

    /// Convert a raw reading with the sensor's calibration
    pub fn convert(&self, sensor: &Sensor, raw: u16) -> f64 {
        sensor.raw_to_cooked(raw)
    }

    pub fn get(&self, id: u16) -> Option<Arc<Sensor>> {
        self.sensors.get(&id).cloned()
    }

    pub fn contains(&self, id: u16) -> bool {
        self.sensors.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }

    /// Resolve decoded records into data points
    ///
    /// Records for unknown sensors are dropped with a warning when detection
    /// is disabled.
    pub fn data_points(&mut self, records: &[RawRecord]) -> Vec<DataPoint> {
        records
            .iter()
            .filter_map(|record| match self.resolve(record.sensor_id) {
                Ok(sensor) => Some(DataPoint::from_record(record, sensor)),
                Err(e) => {
                    warn!("Dropping reading: {}", e);
                    None
                }
            })
            .collect()
    }
}
