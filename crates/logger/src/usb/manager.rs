//! USB device manager
//!
//! Handles logger enumeration and tracks per-device maintenance timers and
//! error counts. The manager owns every device and its transport handle.

use crate::usb::device::UsbDevice;
use common::{Error, Result};
use protocol::{Frame, PRODUCT_ID, VENDOR_ID};
use rusb::{Context, UsbContext};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default number of consecutive errors tolerated before a device is dropped
pub const DEFAULT_MAX_ERRORS: u32 = 10;

/// Request/response link to one logger
pub trait Transport: Send {
    /// Human readable position on the bus, for logging
    fn location(&self) -> String;

    /// Negotiate configuration and endpoints
    fn initialize(&mut self) -> Result<()>;

    /// Reset the device after a failed initialization
    fn reset(&mut self) -> Result<()>;

    /// Write a command frame and read the response frame
    fn exchange(&mut self, request: &Frame, timeout: Duration) -> Result<Frame>;
}

/// Source of attached loggers
pub trait UsbBackend: Send {
    type Transport: Transport;

    /// Enumerate every attached logger
    fn discover(&self) -> Result<Vec<Self::Transport>>;

    /// Count attached loggers without opening them
    fn count(&self) -> Result<usize> {
        Ok(self.discover()?.len())
    }
}

/// rusb-backed enumeration of loggers matching [`VENDOR_ID`]/[`PRODUCT_ID`]
pub struct RusbBackend {
    context: Context,
}

impl RusbBackend {
    pub fn new() -> Result<Self> {
        let context =
            Context::new().map_err(|e| Error::Transport(format!("USB context: {}", e)))?;
        Ok(Self { context })
    }

    fn matching_devices(&self) -> Result<Vec<rusb::Device<Context>>> {
        let devices = self
            .context
            .devices()
            .map_err(|e| Error::Transport(format!("enumeration failed: {}", e)))?;

        Ok(devices
            .iter()
            .filter(|device| {
                device
                    .device_descriptor()
                    .map(|d| d.vendor_id() == VENDOR_ID && d.product_id() == PRODUCT_ID)
                    .unwrap_or(false)
            })
            .collect())
    }
}

impl UsbBackend for RusbBackend {
    type Transport = UsbDevice;

    fn discover(&self) -> Result<Vec<UsbDevice>> {
        Ok(self
            .matching_devices()?
            .into_iter()
            .map(UsbDevice::new)
            .collect())
    }

    fn count(&self) -> Result<usize> {
        Ok(self.matching_devices()?.len())
    }
}

/// One logger plus its maintenance bookkeeping
///
/// Timestamps are Unix seconds; zero means "never".
pub struct ManagedDevice<T> {
    transport: T,
    pub last_time_sync: u64,
    pub last_flash_erase: u64,
    pub last_data_read: u64,
    pub consecutive_errors: u32,
}

impl<T: Transport> ManagedDevice<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            last_time_sync: 0,
            last_flash_erase: 0,
            last_data_read: 0,
            consecutive_errors: 0,
        }
    }

    pub fn location(&self) -> String {
        self.transport.location()
    }

    /// Write a command frame and read the response frame
    pub fn exchange(&mut self, request: &Frame, timeout: Duration) -> Result<Frame> {
        self.transport.exchange(request, timeout)
    }

    /// Count a failed exchange. Returns the new count.
    pub fn record_error(&mut self) -> u32 {
        self.consecutive_errors += 1;
        self.consecutive_errors
    }

    pub fn record_success(&mut self) {
        self.consecutive_errors = 0;
    }
}

/// USB device manager
///
/// Keeps the active set of loggers. Discovery replaces the set; devices that
/// fail initialization or accumulate too many errors are dropped.
pub struct DeviceManager<B: UsbBackend> {
    backend: B,
    devices: Vec<ManagedDevice<B::Transport>>,
    /// Unix time of the last enumeration
    last_device_check: u64,
    max_errors: u32,
}

impl<B: UsbBackend> DeviceManager<B> {
    pub fn new(backend: B, max_errors: u32) -> Self {
        Self {
            backend,
            devices: Vec::new(),
            last_device_check: 0,
            max_errors,
        }
    }

    /// Enumerate loggers and replace the active set
    pub fn discover(&mut self, now: u64) -> Result<usize> {
        self.last_device_check = now;
        let found = self.backend.discover()?;

        if found.is_empty() {
            warn!("No TL-300/TL-500/BS-510 device found");
        }
        for transport in &found {
            info!("Found TL-300/TL-500/BS-510 device at {}", transport.location());
        }

        self.devices = found.into_iter().map(ManagedDevice::new).collect();
        Ok(self.devices.len())
    }

    /// Check whether the number of attached loggers changed
    pub fn needs_rediscovery(&mut self, now: u64) -> bool {
        self.last_device_check = now;
        match self.backend.count() {
            Ok(count) => {
                debug!(
                    "Device check: {} attached, {} tracked",
                    count,
                    self.devices.len()
                );
                count != self.devices.len()
            }
            Err(e) => {
                warn!("Device check failed: {}", e);
                false
            }
        }
    }

    /// Initialize one device
    pub fn initialize(device: &mut ManagedDevice<B::Transport>) -> Result<()> {
        device.transport.initialize()
    }

    /// Initialize every device, resetting and dropping the ones that fail
    pub fn initialize_all(&mut self) {
        self.devices.retain_mut(|device| match Self::initialize(device) {
            Ok(()) => true,
            Err(e) => {
                error!(
                    "Error initializing device at {}. Resetting and removing device: {}",
                    device.location(),
                    e
                );
                if let Err(reset_err) = device.transport.reset() {
                    error!("Error resetting device: {}", reset_err);
                }
                false
            }
        });
    }

    /// Drop devices whose error count exceeds the threshold
    pub fn remove_failed(&mut self) -> usize {
        let max_errors = self.max_errors;
        let before = self.devices.len();

        self.devices.retain(|device| {
            let keep = device.consecutive_errors <= max_errors;
            if !keep {
                warn!(
                    "Too many errors. Removing device on {}",
                    device.location()
                );
            }
            keep
        });

        before - self.devices.len()
    }

    pub fn devices(&self) -> &[ManagedDevice<B::Transport>] {
        &self.devices
    }

    pub fn devices_mut(&mut self) -> &mut [ManagedDevice<B::Transport>] {
        &mut self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn last_device_check(&self) -> u64 {
        self.last_device_check
    }

    pub fn max_errors(&self) -> u32 {
        self.max_errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::fake::{FakeBackend, FakeLogger};

    #[test]
    fn test_discover_replaces_set() {
        let backend = FakeBackend::new(vec![FakeLogger::new("a"), FakeLogger::new("b")]);
        let mut manager = DeviceManager::new(backend.clone(), DEFAULT_MAX_ERRORS);

        assert_eq!(manager.discover(100).unwrap(), 2);
        assert_eq!(manager.last_device_check(), 100);

        manager.devices_mut()[0].consecutive_errors = 5;
        backend.set_loggers(vec![FakeLogger::new("a")]);
        assert_eq!(manager.discover(200).unwrap(), 1);
        assert_eq!(manager.devices()[0].consecutive_errors, 0);
    }

    #[test]
    fn test_needs_rediscovery_compares_counts() {
        let backend = FakeBackend::new(vec![FakeLogger::new("a")]);
        let mut manager = DeviceManager::new(backend.clone(), DEFAULT_MAX_ERRORS);
        manager.discover(0).unwrap();

        assert!(!manager.needs_rediscovery(60));
        assert_eq!(manager.last_device_check(), 60);

        backend.set_loggers(vec![FakeLogger::new("a"), FakeLogger::new("b")]);
        assert!(manager.needs_rediscovery(120));
    }

    #[test]
    fn test_initialize_drops_and_resets_failures() {
        let broken = FakeLogger::new("broken").failing_init();
        let backend = FakeBackend::new(vec![FakeLogger::new("good"), broken.clone()]);
        let mut manager = DeviceManager::new(backend, DEFAULT_MAX_ERRORS);
        manager.discover(0).unwrap();

        manager.initialize_all();

        assert_eq!(manager.len(), 1);
        assert_eq!(manager.devices()[0].location(), "good");
        assert_eq!(broken.resets(), 1);
    }

    #[test]
    fn test_remove_failed_threshold() {
        let backend = FakeBackend::new(vec![FakeLogger::new("a"), FakeLogger::new("b")]);
        let mut manager = DeviceManager::new(backend, DEFAULT_MAX_ERRORS);
        manager.discover(0).unwrap();

        manager.devices_mut()[0].consecutive_errors = 10;
        assert_eq!(manager.remove_failed(), 0);

        manager.devices_mut()[0].record_error();
        assert_eq!(manager.remove_failed(), 1);
        assert_eq!(manager.devices()[0].location(), "b");
    }

    #[test]
    fn test_record_success_resets_errors() {
        let mut device = ManagedDevice::new(FakeLogger::new("a"));
        assert_eq!(device.record_error(), 1);
        assert_eq!(device.record_error(), 2);
        device.record_success();
        assert_eq!(device.consecutive_errors, 0);
    }

    #[test]
    fn test_discover_failure_keeps_set() {
        let backend = FakeBackend::new(vec![FakeLogger::new("a")]);
        let mut manager = DeviceManager::new(backend.clone(), DEFAULT_MAX_ERRORS);
        manager.discover(0).unwrap();

        backend.fail_enumeration(true);
        assert!(manager.discover(10).is_err());
        assert_eq!(manager.len(), 1);
        assert!(!manager.needs_rediscovery(20));
    }
}
