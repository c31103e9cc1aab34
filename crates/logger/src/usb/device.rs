//! USB device abstraction
//!
//! This module provides a wrapper around rusb::Device for one attached
//! logger: it opens the device, negotiates the configuration and bulk
//! endpoints, and performs request/response exchanges.

use crate::usb::manager::Transport;
use crate::usb::transfers::{Endpoints, execute_exchange, map_rusb_error};
use common::{Error, Result};
use protocol::Frame;
use rusb::{Context, Device, DeviceHandle, Direction, TransferType};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Interface carrying the logger's bulk endpoints
const INTERFACE: u8 = 0;

/// USB logger wrapper
pub struct UsbDevice {
    /// Underlying rusb device
    device: Device<Context>,
    /// Device handle (if opened)
    handle: Option<DeviceHandle<Context>>,
    /// Bulk endpoints (if negotiated)
    endpoints: Option<Endpoints>,
}

impl UsbDevice {
    pub fn new(device: Device<Context>) -> Self {
        Self {
            device,
            handle: None,
            endpoints: None,
        }
    }

    /// Get the bus number
    pub fn bus_number(&self) -> u8 {
        self.device.bus_number()
    }

    /// Get the device address
    pub fn device_address(&self) -> u8 {
        self.device.address()
    }

    /// Get the port number on the parent hub
    pub fn port_number(&self) -> u8 {
        self.device.port_number()
    }

    fn open_handle(&mut self) -> Result<&mut DeviceHandle<Context>> {
        if self.handle.is_none() {
            let handle = self
                .device
                .open()
                .map_err(|e| Error::DeviceInit(format!("open failed: {}", e)))?;
            debug!("Opened device {}", self.location());
            self.handle = Some(handle);
        }

        self.handle
            .as_mut()
            .ok_or_else(|| Error::DeviceInit("device handle unavailable".to_string()))
    }

    /// Find the bulk IN and OUT endpoints on the logger interface
    fn find_endpoints(&self) -> Result<Endpoints> {
        let config = self
            .device
            .active_config_descriptor()
            .map_err(|e| Error::DeviceInit(format!("no active configuration: {}", e)))?;

        let interface = config
            .interfaces()
            .find(|i| i.number() == INTERFACE)
            .ok_or_else(|| Error::DeviceInit(format!("interface {} missing", INTERFACE)))?;

        let mut input = None;
        let mut output = None;
        for descriptor in interface.descriptors() {
            for endpoint in descriptor.endpoint_descriptors() {
                if endpoint.transfer_type() != TransferType::Bulk {
                    continue;
                }
                match endpoint.direction() {
                    Direction::In => input = input.or(Some(endpoint.address())),
                    Direction::Out => output = output.or(Some(endpoint.address())),
                }
            }
        }

        match (input, output) {
            (Some(input), Some(output)) => Ok(Endpoints { input, output }),
            _ => Err(Error::DeviceInit(
                "bulk IN/OUT endpoints not found".to_string(),
            )),
        }
    }
}

impl Transport for UsbDevice {
    fn location(&self) -> String {
        format!(
            "Bus {} Address {} Port Number {}",
            self.bus_number(),
            self.device_address(),
            self.port_number()
        )
    }

    fn initialize(&mut self) -> Result<()> {
        let configuration = self
            .device
            .config_descriptor(0)
            .map_err(|e| Error::DeviceInit(format!("no configuration descriptor: {}", e)))?
            .number();

        let handle = self.open_handle()?;

        // Detach kernel driver if active
        match handle.kernel_driver_active(INTERFACE) {
            Ok(true) => {
                if let Err(e) = handle.detach_kernel_driver(INTERFACE) {
                    warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        INTERFACE, e
                    );
                }
            }
            Ok(false) => {}
            Err(e) => {
                debug!("Could not check kernel driver status: {}", e);
            }
        }

        handle
            .set_active_configuration(configuration)
            .map_err(|e| Error::DeviceInit(format!("set configuration failed: {}", e)))?;
        handle
            .claim_interface(INTERFACE)
            .map_err(|e| Error::DeviceInit(format!("claim interface failed: {}", e)))?;

        let endpoints = self.find_endpoints()?;
        info!(
            "Device on {} uses addresses {:#04x}/{:#04x} for in/out",
            self.location(),
            endpoints.input,
            endpoints.output
        );
        self.endpoints = Some(endpoints);
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.endpoints = None;
        let handle = self.open_handle()?;
        handle
            .reset()
            .map_err(|e| map_rusb_error("reset", e))?;
        debug!("Reset device {}", self.location());
        Ok(())
    }

    fn exchange(&mut self, request: &Frame, timeout: Duration) -> Result<Frame> {
        let endpoints = self
            .endpoints
            .ok_or_else(|| Error::Transport("device not initialized".to_string()))?;
        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| Error::Transport("device not open".to_string()))?;

        execute_exchange(handle, endpoints, request, timeout)
    }
}

impl Drop for UsbDevice {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.as_mut()
            && self.endpoints.is_some()
            && let Err(e) = handle.release_interface(INTERFACE)
        {
            debug!("Failed to release interface {}: {}", INTERFACE, e);
        }
    }
}
