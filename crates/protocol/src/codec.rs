//! Response frame parsing
//!
//! Response frames have no length prefix. The parser walks the frame byte by
//! byte:
//!
//! ```text
//! 0x00              padding, skipped
//! 0xff              end of data, scanning stops
//! 0x09 (pos <= 54)  short record: [09][id u16 LE][raw u16 BE][time u32 LE]
//! 0x0a (pos <= 54)  long record:  [0a][id u16 LE][raw u16 BE][time u32 LE][signal u8]
//! anything else     noise, skipped
//! ```
//!
//! After a record the cursor moves to `marker + 9` regardless of the record
//! length, so the signal byte of a long record is scanned as an ordinary
//! position.
//!
//! A frame starting with two zero bytes means the logger has nothing buffered.

use crate::error::{ProtocolError, Result};
use crate::types::{FRAME_SIZE, RawRecord};
use byteorder::{BigEndian, ByteOrder, LittleEndian};

/// Padding byte
const PADDING: u8 = 0x00;

/// End-of-data sentinel
const END_OF_DATA: u8 = 0xff;

/// Marker for a record without signal strength
const SHORT_RECORD: u8 = 0x09;

/// Marker for a record with trailing signal strength
const LONG_RECORD: u8 = 0x0a;

/// Last position at which a record marker is honoured
const LAST_RECORD_START: usize = 54;

/// Cursor advance after a decoded record, on top of the per-position step
const RECORD_SKIP: usize = 8;

/// Decoded response frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// The logger has no buffered readings
    NoData,
    /// Records found in the frame (possibly none if the frame held only noise)
    Records(Vec<RawRecord>),
}

/// Check for the "no new data" signal
pub fn is_no_data(frame: &[u8]) -> bool {
    frame.len() >= 2 && frame[0] == PADDING && frame[1] == PADDING
}

/// Decode a response frame, distinguishing "no data" from a data frame
pub fn decode_response(frame: &[u8]) -> Result<Response> {
    if frame.len() < FRAME_SIZE {
        return Err(ProtocolError::FrameTooShort {
            expected: FRAME_SIZE,
            actual: frame.len(),
        });
    }

    if is_no_data(frame) {
        return Ok(Response::NoData);
    }

    Ok(Response::Records(parse_frame(frame)))
}

/// Extract every record from a response frame
///
/// Pure and deterministic. Bytes beyond [`FRAME_SIZE`] are ignored and a
/// shorter slice is scanned only as far as it goes.
pub fn parse_frame(frame: &[u8]) -> Vec<RawRecord> {
    record_starts(frame)
        .into_iter()
        .map(|(pos, marker)| decode_record(&frame[pos..], marker == LONG_RECORD))
        .collect()
}

/// Number of leading bytes that must be real data for [`parse_frame`]
///
/// This is the end of the last record the scan decodes, and at least the
/// two bytes of the "no new data" check. A transfer that delivered fewer
/// bytes would have records decoded from padding.
pub fn required_len(frame: &[u8]) -> usize {
    record_starts(frame)
        .last()
        .map(|&(pos, marker)| pos + record_len(marker))
        .unwrap_or(0)
        .max(2)
}

/// Positions and markers of the records the scan accepts
fn record_starts(frame: &[u8]) -> Vec<(usize, u8)> {
    let mut starts = Vec::new();

    if is_no_data(frame) {
        return starts;
    }

    let len = frame.len().min(FRAME_SIZE);
    let mut pos = 0;

    while pos < len {
        match frame[pos] {
            PADDING => {}
            END_OF_DATA => break,
            marker @ (SHORT_RECORD | LONG_RECORD)
                if pos <= LAST_RECORD_START && pos + record_len(marker) <= len =>
            {
                starts.push((pos, marker));
                pos += RECORD_SKIP;
            }
            _ => {}
        }
        pos += 1;
    }

    starts
}

fn record_len(marker: u8) -> usize {
    if marker == LONG_RECORD { 10 } else { 9 }
}

fn decode_record(bytes: &[u8], has_signal: bool) -> RawRecord {
    RawRecord {
        sensor_id: LittleEndian::read_u16(&bytes[1..3]),
        raw_value: BigEndian::read_u16(&bytes[3..5]),
        timestamp: RawRecord::calendar_time(LittleEndian::read_u32(&bytes[5..9])),
        signal: has_signal.then(|| bytes[9]),
    }
}
