//! Protocol constants and record types

/// USB vendor ID of the supported loggers
pub const VENDOR_ID: u16 = 0x0451;

/// USB product ID of the supported loggers
pub const PRODUCT_ID: u16 = 0x3211;

/// Size of every bulk transfer in either direction
pub const FRAME_SIZE: usize = 64;

/// Seconds between the Unix epoch and the logger's internal clock epoch
pub const EPOCH_OFFSET: u32 = 946_681_200;

/// One 64-byte transfer unit
pub type Frame = [u8; FRAME_SIZE];

/// Unconverted reading decoded from a response frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawRecord {
    /// Sensor address (little-endian on the wire)
    pub sensor_id: u16,
    /// Raw reading (big-endian on the wire)
    pub raw_value: u16,
    /// Unix timestamp in seconds (device clock plus [`EPOCH_OFFSET`])
    pub timestamp: u64,
    /// Radio signal strength, present only for long records
    pub signal: Option<u8>,
}

impl RawRecord {
    /// Convert a device clock value to a Unix timestamp
    pub fn calendar_time(device_time: u32) -> u64 {
        u64::from(device_time) + u64::from(EPOCH_OFFSET)
    }

    /// Convert a Unix timestamp to the device clock
    ///
    /// Times before the device epoch clamp to zero.
    pub fn device_time(unix_time: u64) -> u32 {
        let since_epoch = unix_time.saturating_sub(u64::from(EPOCH_OFFSET));
        u32::try_from(since_epoch).unwrap_or(u32::MAX)
    }
}
