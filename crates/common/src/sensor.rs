//! Sensor definitions and calibration
//!
//! A [`Sensor`] is a logical measurement channel addressed by the id that
//! appears in protocol records. Raw readings are converted to physical
//! units with a polynomial:
//!
//! ```text
//! cooked = Σ coefficient(n) · raw^n
//! ```
//!
//! `coefficient(n)` comes from the sensor's own [`Calibration`] when it
//! defines order `n`, otherwise from the factory default for its
//! [`SensorKind`], otherwise zero.

use std::collections::BTreeMap;
use std::fmt;

/// Name given to sensors that were not named in the configuration
pub const UNKNOWN_NAME: &str = "Unknown";

/// Model string given to sensors that were not declared in the configuration
pub const UNKNOWN_MODEL: &str = "Unknown";

/// Models reporting temperature only
pub const TEMPERATURE_MODELS: &[&str] = &["TL-3TSN", "TSN-50E", "TSN-EXT44", "TSN-33MN"];

/// Models reporting temperature on `id` and humidity on `id + 1`
pub const COMBINED_MODELS: &[&str] = &["TSN-TH70E", "TSN-TH77ext"];

/// Measured quantity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorKind {
    Temperature,
    Humidity,
    Unknown,
}

impl SensorKind {
    /// Guess the kind from the sensor address: even ids are temperature,
    /// odd ids are humidity.
    pub fn from_parity(id: u16) -> Self {
        if id % 2 == 0 {
            SensorKind::Temperature
        } else {
            SensorKind::Humidity
        }
    }

    /// Display unit
    pub fn unit(&self) -> &'static str {
        match self {
            SensorKind::Temperature => "°C",
            SensorKind::Humidity => "%RH",
            SensorKind::Unknown => "",
        }
    }

    /// Factory conversion curve
    pub fn default_calibration(&self) -> Calibration {
        match self {
            SensorKind::Temperature => Calibration::from_pairs([(0, 0.0), (1, 0.0078125)]),
            SensorKind::Humidity => Calibration::from_pairs([(0, -6.0), (1, 125.0 / 65536.0)]),
            SensorKind::Unknown => Calibration::from_pairs([(1, 1.0)]),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SensorKind::Temperature => "Temperature",
            SensorKind::Humidity => "Humidity",
            SensorKind::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Polynomial coefficients keyed by order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Calibration {
    coefficients: BTreeMap<u32, f64>,
}

impl Calibration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (u32, f64)>) -> Self {
        Self {
            coefficients: pairs.into_iter().collect(),
        }
    }

    /// Set the coefficient for one order, replacing any previous value
    pub fn set(&mut self, order: u32, coefficient: f64) {
        self.coefficients.insert(order, coefficient);
    }

    pub fn get(&self, order: u32) -> Option<f64> {
        self.coefficients.get(&order).copied()
    }

    /// Orders with a defined coefficient, ascending
    pub fn orders(&self) -> impl Iterator<Item = u32> + '_ {
        self.coefficients.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.coefficients.is_empty()
    }

    /// Evaluate the polynomial, falling back to `defaults` for orders this
    /// calibration does not define.
    pub fn evaluate(&self, defaults: &Calibration, raw: f64) -> f64 {
        let mut orders: Vec<u32> = self.orders().chain(defaults.orders()).collect();
        orders.sort_unstable();
        orders.dedup();

        orders
            .into_iter()
            .map(|order| {
                let coefficient = self.get(order).or_else(|| defaults.get(order)).unwrap_or(0.0);
                coefficient * raw.powi(i32::try_from(order).unwrap_or(i32::MAX))
            })
            .sum()
    }
}

/// A logical sensor
#[derive(Debug, Clone, PartialEq)]
pub struct Sensor {
    id: u16,
    kind: SensorKind,
    model: String,
    name: String,
    calibration: Calibration,
}

impl Sensor {
    pub fn new(id: u16, kind: SensorKind, model: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            model: model.into(),
            name: name.into(),
            calibration: Calibration::new(),
        }
    }

    /// Sensor synthesized for an id seen on the wire but never configured
    pub fn guessed(id: u16) -> Self {
        Self::new(id, SensorKind::from_parity(id), UNKNOWN_MODEL, UNKNOWN_NAME)
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn kind(&self) -> SensorKind {
        self.kind
    }

    /// Manufacturer model, e.g. "TSN-TH70E"
    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> &'static str {
        self.kind.unit()
    }

    /// User calibration (without factory defaults)
    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    pub fn set_calibration(&mut self, order: u32, coefficient: f64) {
        self.calibration.set(order, coefficient);
    }

    /// Convert a raw reading to physical units
    pub fn raw_to_cooked(&self, raw: u16) -> f64 {
        self.calibration
            .evaluate(&self.kind.default_calibration(), f64::from(raw))
    }
}
