//! Output listeners
//!
//! Concrete [`DataListener`] implementations and the registry that builds
//! them from `[[output]]` configuration entries. Each entry names a listener
//! type tag and carries a free-form parameter table.

pub mod file;
pub mod logging;
pub mod mqtt;
pub mod recent;

pub use file::FileOutListener;
pub use logging::LoggingListener;
pub use mqtt::MqttListener;
pub use recent::RecentValuesListener;

use common::{DataListener, Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::runtime::Handle;

/// Free-form `params` table of an `[[output]]` entry
pub type ListenerParams = toml::Table;

/// Resources a listener may need at construction time
#[derive(Debug, Clone, Default)]
pub struct ListenerContext {
    /// Runtime for listeners that serve network clients
    pub runtime: Option<Handle>,
}

impl ListenerContext {
    pub fn with_runtime(runtime: Handle) -> Self {
        Self {
            runtime: Some(runtime),
        }
    }
}

pub type ListenerConstructor =
    fn(&ListenerParams, &ListenerContext) -> Result<Arc<dyn DataListener>>;

/// Maps listener type tags to constructors
pub struct ListenerRegistry {
    constructors: BTreeMap<String, ListenerConstructor>,
}

impl ListenerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Registry with the listeners shipped in this crate
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(LoggingListener::TAG, LoggingListener::from_params);
        registry.register(FileOutListener::TAG, FileOutListener::from_params);
        registry.register(RecentValuesListener::TAG, RecentValuesListener::from_params);
        registry.register(MqttListener::TAG, MqttListener::from_params);
        registry
    }

    pub fn register(&mut self, tag: &str, constructor: ListenerConstructor) {
        self.constructors.insert(tag.to_string(), constructor);
    }

    /// Construct the listener registered under `tag`
    pub fn build(
        &self,
        tag: &str,
        params: &ListenerParams,
        context: &ListenerContext,
    ) -> Result<Arc<dyn DataListener>> {
        let constructor = self
            .constructors
            .get(tag)
            .ok_or_else(|| Error::Configuration(format!("Unknown listener type '{}'", tag)))?;
        constructor(params, context)
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

/// String parameter, `default` when absent
pub(crate) fn string_param(params: &ListenerParams, key: &str, default: &str) -> Result<String> {
    match params.get(key) {
        None => Ok(default.to_string()),
        Some(toml::Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(Error::Configuration(format!(
            "Parameter '{}' must be a string, got {}",
            key,
            other.type_str()
        ))),
    }
}

/// TCP port parameter, `default` when absent
pub(crate) fn port_param(params: &ListenerParams, key: &str, default: u16) -> Result<u16> {
    match params.get(key) {
        None => Ok(default),
        Some(toml::Value::Integer(n)) => u16::try_from(*n)
            .map_err(|_| Error::Configuration(format!("Port {} out of range", n))),
        Some(toml::Value::String(s)) => s
            .parse()
            .map_err(|_| Error::Configuration(format!("Invalid port '{}'", s))),
        Some(other) => Err(Error::Configuration(format!(
            "Parameter '{}' must be a port number, got {}",
            key,
            other.type_str()
        ))),
    }
}
