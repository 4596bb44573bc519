//! USB device monitor
//!
//! Library half of the `usb-monitor` binary. The [`usb::Monitor`] facade
//! ties together device filtering, permission brokering, connection
//! pooling and periodic reconciliation against a pluggable
//! [`usb::UsbHost`].

pub mod config;
pub mod test_utils;
pub mod usb;

pub use config::MonitorConfig;
pub use usb::{DeviceListener, Monitor, MonitorEvent, MonitorSettings, RusbHost, UsbHost};
