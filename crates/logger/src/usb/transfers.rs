//! USB transfer execution
//!
//! Bulk request/response exchange with a logger. Every exchange writes one
//! 64-byte command frame to the OUT endpoint and reads one 64-byte response
//! frame from the IN endpoint.

use common::{Error, Result};
use protocol::{FRAME_SIZE, Frame, required_len};
use rusb::{Context, DeviceHandle};
use std::time::Duration;
use tracing::trace;

/// Default timeout for each bulk transfer
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Pause between writing a request and reading the response
const RESPONSE_DELAY: Duration = Duration::from_millis(10);

/// Bulk endpoint addresses negotiated during initialization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    pub input: u8,
    pub output: u8,
}

/// Write `request` and read the response frame
///
/// A short response is zero padded to a full frame as long as it holds
/// every record the parser will decode.
pub fn execute_exchange(
    handle: &mut DeviceHandle<Context>,
    endpoints: Endpoints,
    request: &Frame,
    timeout: Duration,
) -> Result<Frame> {
    let written = handle
        .write_bulk(endpoints.output, request, timeout)
        .map_err(|e| map_rusb_error("write", e))?;

    if written != FRAME_SIZE {
        return Err(Error::Transport(format!(
            "short write: {} of {} bytes",
            written, FRAME_SIZE
        )));
    }

    std::thread::sleep(RESPONSE_DELAY);

    let mut response = [0u8; FRAME_SIZE];
    let read = handle
        .read_bulk(endpoints.input, &mut response, timeout)
        .map_err(|e| map_rusb_error("read", e))?;

    trace!(
        "Exchange opcode={:#04x}: {} bytes in {:02x?}",
        request[0],
        read,
        &response[..read]
    );

    check_response_len(&response, read)?;
    Ok(response)
}

/// Reject a read that stopped before the data the parser will consume
pub fn check_response_len(response: &Frame, read: usize) -> Result<()> {
    let required = required_len(response);
    if read < required {
        return Err(Error::Transport(format!(
            "short read: {} of {} bytes",
            read, required
        )));
    }
    Ok(())
}

/// Map rusb::Error to a transport error
pub fn map_rusb_error(operation: &str, err: rusb::Error) -> Error {
    match err {
        rusb::Error::Timeout => Error::Transport(format!("{} timed out", operation)),
        rusb::Error::NoDevice => Error::Transport(format!("{} failed: device gone", operation)),
        _ => Error::Transport(format!("{} failed: {}", operation, err)),
    }
}
