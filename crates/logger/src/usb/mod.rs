//! USB subsystem
//!
//! Manages logger discovery, device lifecycle and the poll loop.
//!
//! This module implements the USB side of the logger:
//! - Enumeration of devices matching the logger vendor/product id
//! - Endpoint negotiation and reset-and-drop on initialization failure
//! - Bulk request/response exchanges with a per-operation timeout
//! - The poll worker that drives maintenance and data acquisition
//!
//! All USB I/O happens on the poll worker thread. Devices are serviced one
//! after another, so device state needs no locking.

pub mod device;
pub mod manager;
pub mod transfers;
pub mod worker;

#[cfg(test)]
pub(crate) mod fake;

// Re-export public types
pub use device::UsbDevice;
pub use manager::{DeviceManager, ManagedDevice, RusbBackend, Transport, UsbBackend};
pub use worker::{PollSettings, Poller, spawn_poll_worker};
