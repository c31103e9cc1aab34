//! Outbound command frames
//!
//! Each command occupies byte 0 of an otherwise zero-filled 64-byte frame.
//! Only [`Command::SetClock`] carries a payload: the device time as a
//! little-endian `u32` in bytes 1..5.

use crate::error::{ProtocolError, Result};
use crate::types::{FRAME_SIZE, Frame, RawRecord};
use byteorder::{ByteOrder, LittleEndian};

/// Opcode byte values
pub mod opcode {
    /// Request buffered sensor readings
    pub const POLL: u8 = 0x03;
    /// Set the device clock
    pub const SET_CLOCK: u8 = 0x04;
    /// Erase the internal flash
    pub const ERASE_FLASH: u8 = 0x0d;
}

/// Command sent to a logger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Ask for the next batch of readings
    Poll,
    /// Set the device clock to the given Unix time (seconds)
    SetClock { unix_time: u64 },
    /// Erase the internal flash storage
    EraseFlash,
}

impl Command {
    /// Opcode byte for this command
    pub fn opcode(&self) -> u8 {
        match self {
            Command::Poll => opcode::POLL,
            Command::SetClock { .. } => opcode::SET_CLOCK,
            Command::EraseFlash => opcode::ERASE_FLASH,
        }
    }

    /// Build the 64-byte request frame
    pub fn encode(&self) -> Frame {
        let mut frame = [0u8; FRAME_SIZE];
        frame[0] = self.opcode();

        if let Command::SetClock { unix_time } = self {
            LittleEndian::write_u32(&mut frame[1..5], RawRecord::device_time(*unix_time));
        }

        frame
    }

    /// Decode a request frame
    ///
    /// The clock payload is converted back to Unix time, so a round trip
    /// through the device epoch is exact for times after 2000-01-01.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < FRAME_SIZE {
            return Err(ProtocolError::FrameTooShort {
                expected: FRAME_SIZE,
                actual: frame.len(),
            });
        }

        match frame[0] {
            opcode::POLL => Ok(Command::Poll),
            opcode::SET_CLOCK => Ok(Command::SetClock {
                unix_time: RawRecord::calendar_time(LittleEndian::read_u32(&frame[1..5])),
            }),
            opcode::ERASE_FLASH => Ok(Command::EraseFlash),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }
}
