//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame shorter than the fixed transfer size
    #[error("Frame too short: expected {expected} bytes, got {actual}")]
    FrameTooShort { expected: usize, actual: usize },

    /// Opcode byte does not name a known command
    #[error("Unknown opcode: {0:#04x}")]
    UnknownOpcode(u8),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
