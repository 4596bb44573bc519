//! Common utilities for usb-monitor
//!
//! This crate provides the leaf types shared by the monitor core and its
//! host backends: USB descriptor snapshots, the error taxonomy, the
//! event-source channel, and logging setup.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;
pub mod usb_types;

pub use channel::{EventReceiver, EventSender, HostEvent, create_event_channel};
pub use error::{Error, HostError, Result};
pub use logging::setup_logging;
pub use usb_types::{DeviceInfo, UsbDevice, UsbInterface, format_bcd, parse_bus_device};
