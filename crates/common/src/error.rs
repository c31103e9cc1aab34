//! Common error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Bulk write/read failure or timeout on the USB link
    #[error("USB transport error: {0}")]
    Transport(String),

    /// Configuration or endpoint negotiation failed
    #[error("Device initialization error: {0}")]
    DeviceInit(String),

    /// Sensor id not in the registry and detection disabled
    #[error("Unknown sensor: {0}")]
    UnknownSensor(u16),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),
}

pub type Result<T> = std::result::Result<T, Error>;
