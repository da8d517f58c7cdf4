//! lgstray-core: battery telemetry for Logitech HID++ devices.
//!
//! This crate discovers Logitech receivers and devices over USB HID, reads
//! their battery state via the HID++ 2.0 battery features, and distributes the
//! results to other processes through an event bus and a shared-memory
//! snapshot. It also supervises the privileged process that owns the devices.

pub mod battery;
pub mod bus;
pub mod comm;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod group;
pub mod hidpp;
pub mod hotplug;
#[cfg(test)]
mod integration_tests;
pub mod ipc;
pub mod logical;
pub mod safety;
pub mod snapshot;
pub mod supervisor;
pub mod topology;
pub mod transport;

/// Logitech USB Vendor ID.
pub const LOGITECH_VID: u16 = 0x046D;
