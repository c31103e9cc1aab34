//! Arexx TL-300/TL-500/BS-510 data logger service
//!
//! Polls every attached logger over USB, converts the readings with the
//! configured sensor calibration and hands them to the configured outputs.

pub mod config;
pub mod listeners;
pub mod service;
pub mod usb;
