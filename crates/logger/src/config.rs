//! Logger configuration
//!
//! ```toml
//! [logger]
//! log_level = "info"
//! detect_unknown_sensors = true
//!
//! [[sensors]]
//! id = 10
//! type = "TSN-TH70E"
//! name = "Cellar"
//!
//! [[calibration]]
//! id = 10
//! values = { "0" = -0.5, "1" = 0.0078125 }
//!
//! [[output]]
//! type = "FileOutListener"
//! params = { filename = "/var/log/arexx.csv" }
//! ```
//!
//! Sections are read independently. A malformed section or entry is logged
//! and skipped, the rest of the file still applies.

use crate::listeners::{ListenerContext, ListenerParams, ListenerRegistry, LoggingListener};
use crate::usb::PollSettings;
use anyhow::{Context, Result, anyhow};
use common::{Error, ListenerSet, SensorRegistry};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggerConfig {
    #[serde(default)]
    pub logger: LoggerSettings,
    #[serde(default)]
    pub sensors: Vec<SensorDefinition>,
    #[serde(default)]
    pub calibration: Vec<CalibrationEntry>,
    #[serde(default)]
    pub output: Vec<OutputDefinition>,
    /// Sections or entries dropped while parsing
    #[serde(skip)]
    skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggerSettings {
    #[serde(default = "LoggerSettings::default_log_level")]
    pub log_level: String,
    /// Create guessed sensors for ids not defined in `[[sensors]]`
    #[serde(default = "LoggerSettings::default_detect_unknown")]
    pub detect_unknown_sensors: bool,
    #[serde(default = "LoggerSettings::default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "LoggerSettings::default_device_check_interval")]
    pub device_check_interval_secs: u64,
    #[serde(default = "LoggerSettings::default_usb_timeout")]
    pub usb_timeout_ms: u64,
    #[serde(default = "LoggerSettings::default_time_sync_interval")]
    pub time_sync_interval_secs: u64,
    #[serde(default = "LoggerSettings::default_flash_erase_interval")]
    pub flash_erase_interval_secs: u64,
    /// Consecutive failed reads tolerated before a device is dropped
    #[serde(default = "LoggerSettings::default_max_device_errors")]
    pub max_device_errors: u32,
}

impl LoggerSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }

    fn default_detect_unknown() -> bool {
        true
    }

    fn default_poll_interval() -> u64 {
        4
    }

    fn default_device_check_interval() -> u64 {
        60
    }

    fn default_usb_timeout() -> u64 {
        1000
    }

    fn default_time_sync_interval() -> u64 {
        900 // 15 minutes
    }

    fn default_flash_erase_interval() -> u64 {
        86_400 // daily
    }

    fn default_max_device_errors() -> u32 {
        10
    }
}

impl Default for LoggerSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            detect_unknown_sensors: Self::default_detect_unknown(),
            poll_interval_secs: Self::default_poll_interval(),
            device_check_interval_secs: Self::default_device_check_interval(),
            usb_timeout_ms: Self::default_usb_timeout(),
            time_sync_interval_secs: Self::default_time_sync_interval(),
            flash_erase_interval_secs: Self::default_flash_erase_interval(),
            max_device_errors: Self::default_max_device_errors(),
        }
    }
}

/// A configured sensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorDefinition {
    pub id: u16,
    /// Manufacturer model, e.g. "TSN-TH70E"
    #[serde(rename = "type")]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Calibration coefficients of one sensor, keyed by polynomial order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationEntry {
    pub id: u16,
    pub values: BTreeMap<String, f64>,
}

/// One output listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub params: ListenerParams,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            logger: LoggerSettings::default(),
            sensors: Vec::new(),
            calibration: Vec::new(),
            output: vec![OutputDefinition {
                kind: LoggingListener::TAG.to_string(),
                params: ListenerParams::new(),
            }],
            skipped: 0,
        }
    }
}

impl LoggerConfig {
    /// Parse a configuration document
    ///
    /// Fails only on TOML syntax errors; malformed sections, entries and
    /// settings are logged and skipped or reset to their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut document: toml::Table = toml::from_str(content).context("Invalid TOML")?;
        let mut config = Self {
            output: Vec::new(),
            ..Self::default()
        };

        if let Some(value) = document.remove("logger") {
            match value.try_into::<LoggerSettings>() {
                Ok(settings) => config.logger = settings,
                Err(e) => config.report(&format!("section [logger]: {}", e)),
            }
        }

        config.sensors = config.entries(&mut document, "sensors");
        config.calibration = config.entries(&mut document, "calibration");
        config.output = config.entries(&mut document, "output");

        for key in document.keys() {
            warn!("Ignoring unknown configuration section '{}'", key);
        }

        config.sanitize();
        Ok(config)
    }

    /// Deserialize every entry of an array section, skipping bad ones
    fn entries<T: DeserializeOwned>(&mut self, document: &mut toml::Table, section: &str) -> Vec<T> {
        let Some(value) = document.remove(section) else {
            return Vec::new();
        };

        let toml::Value::Array(items) = value else {
            self.report(&format!("section [[{}]] must be an array of tables", section));
            return Vec::new();
        };

        items
            .into_iter()
            .enumerate()
            .filter_map(|(index, item)| match item.try_into::<T>() {
                Ok(entry) => Some(entry),
                Err(e) => {
                    self.report(&format!("entry {} of [[{}]]: {}", index + 1, section, e));
                    None
                }
            })
            .collect()
    }

    fn report(&mut self, message: &str) {
        error!("{}", Error::Configuration(message.trim().to_string()));
        self.skipped += 1;
    }

    /// Number of sections and entries dropped while parsing
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Load configuration from the specified path or the standard locations
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            expand_path(&p)
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/arexx-logger/logger.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                warn!("Failed to load config: {:#}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("arexx-logger").join("logger.toml")
        } else {
            PathBuf::from(".config/arexx-logger/logger.toml")
        }
    }

    /// Reset out-of-range settings to their defaults
    fn sanitize(&mut self) {
        if !VALID_LOG_LEVELS.contains(&self.logger.log_level.as_str()) {
            let message = format!(
                "Invalid log level '{}', must be one of: {}",
                self.logger.log_level,
                VALID_LOG_LEVELS.join(", ")
            );
            self.report(&message);
            self.logger.log_level = LoggerSettings::default_log_level();
        }

        if self.logger.usb_timeout_ms == 0 {
            self.report("usb_timeout_ms must be greater than 0");
            self.logger.usb_timeout_ms = LoggerSettings::default_usb_timeout();
        }
    }

    /// Define configured sensors and their calibration in `registry`
    ///
    /// Returns the number of sensor ids defined.
    pub fn apply_sensors(&self, registry: &mut SensorRegistry) -> usize {
        registry.set_detect_unknown(self.logger.detect_unknown_sensors);

        let mut defined = 0;
        for sensor in &self.sensors {
            let name = sensor.name.as_deref().unwrap_or(common::sensor::UNKNOWN_NAME);
            info!(
                "Adding sensor from config file: {} {} {}",
                sensor.id, sensor.model, name
            );
            match registry.define_model(sensor.id, &sensor.model, name) {
                Ok(ids) => defined += ids.len(),
                Err(e) => error!("Error in config section sensors: {}", e),
            }
        }

        for entry in &self.calibration {
            if !registry.contains(entry.id) {
                error!(
                    "Calibration values found for sensor {}, but sensor not defined in config",
                    entry.id
                );
                continue;
            }

            for (order, coefficient) in &entry.values {
                let Ok(order) = order.trim().parse::<u32>() else {
                    error!(
                        "Error in config section calibration: invalid order '{}' for sensor {}",
                        order, entry.id
                    );
                    continue;
                };
                if let Err(e) = registry.set_calibration(entry.id, order, *coefficient) {
                    error!("Error in config section calibration: {}", e);
                }
            }
        }

        defined
    }

    /// Construct the configured outputs and register them in `listeners`
    ///
    /// Returns the number of listeners registered.
    pub fn build_listeners(
        &self,
        registry: &ListenerRegistry,
        context: &ListenerContext,
        listeners: &ListenerSet,
    ) -> usize {
        let mut registered = 0;
        for output in &self.output {
            match registry.build(&output.kind, &output.params, context) {
                Ok(listener) => {
                    debug!("Registering listener {}", listener.name());
                    listeners.register(listener);
                    registered += 1;
                }
                Err(e) => error!("Error in config section output: {}", e),
            }
        }
        registered
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            poll_interval: Duration::from_secs(self.logger.poll_interval_secs),
            device_check_interval: self.logger.device_check_interval_secs,
            time_sync_interval: self.logger.time_sync_interval_secs,
            flash_erase_interval: self.logger.flash_erase_interval_secs,
            timeout: Duration::from_millis(self.logger.usb_timeout_ms),
        }
    }
}

/// Expand a leading `~` in a user supplied path
pub fn expand_path(path: &Path) -> PathBuf {
    match path.to_str() {
        Some(s) => PathBuf::from(shellexpand::tilde(s).as_ref()),
        None => path.to_path_buf(),
    }
}
