//! Wire protocol for Arexx TL-300 / TL-500 / BS-510 data loggers
//!
//! The loggers speak a fixed-size request/response protocol over USB bulk
//! endpoints. Every transfer in either direction is a 64-byte frame:
//!
//! - Outbound frames carry a one-byte opcode followed by an optional payload
//!   ([`Command`]).
//! - Inbound frames carry zero or more sensor records with no length prefix;
//!   [`parse_frame`] scans for record markers and stops at the end-of-data byte.
//!
//! # Example
//!
//! ```
//! use protocol::{Command, EPOCH_OFFSET, parse_frame};
//!
//! let request = Command::Poll.encode();
//! assert_eq!(request[0], 3);
//!
//! let mut response = [0u8; 64];
//! response[..10].copy_from_slice(&[9, 0x05, 0x00, 0x00, 0x2A, 0x10, 0x00, 0x00, 0x00, 255]);
//! let records = parse_frame(&response);
//! assert_eq!(records.len(), 1);
//! assert_eq!(records[0].sensor_id, 5);
//! assert_eq!(records[0].raw_value, 42);
//! assert_eq!(records[0].timestamp, u64::from(EPOCH_OFFSET) + 16);
//! ```

pub mod codec;
pub mod error;
pub mod messages;
pub mod types;

pub use codec::{Response, decode_response, is_no_data, parse_frame, required_len};
pub use error::{ProtocolError, Result};
pub use messages::{Command, opcode};
pub use types::{EPOCH_OFFSET, FRAME_SIZE, Frame, PRODUCT_ID, RawRecord, VENDOR_ID};
