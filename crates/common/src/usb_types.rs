//! USB type abstractions and utilities
//!
//! A [`UsbDevice`] is a descriptor snapshot taken from the host platform. It
//! is not a handle: the physical device may disappear at any time, and every
//! operation that touches hardware goes back through the host, which reports
//! `HostError::NoDevice` for a stale snapshot.

use serde::{Deserialize, Serialize};

/// Descriptor snapshot of an attached USB device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsbDevice {
    /// Platform device path, e.g. `/dev/bus/usb/001/004`
    pub name: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    /// Serial number, when the platform exposes it without opening the device
    pub serial_number: Option<String>,
    pub manufacturer_name: Option<String>,
    pub product_name: Option<String>,
    /// Device release number (`bcdDevice`) formatted as `major.minor`
    pub version: Option<String>,
    pub configuration_count: u8,
    /// Interfaces of the active configuration, one entry per alternate setting
    pub interfaces: Vec<UsbInterface>,
}

impl UsbDevice {
    /// Number of distinct interface numbers
    pub fn interface_count(&self) -> usize {
        let mut ids: Vec<u8> = self.interfaces.iter().map(|i| i.id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }

    /// Look up an interface by number and alternate setting
    pub fn find_interface(&self, id: u8, alternate_setting: u8) -> Option<&UsbInterface> {
        self.interfaces
            .iter()
            .find(|i| i.id == id && i.alternate_setting == alternate_setting)
    }
}

/// One alternate setting of a USB interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsbInterface {
    pub id: u8,
    pub alternate_setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoint_count: u8,
}

/// Human-readable strings and versions read from an opened device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// USB specification release (`bcdUSB`)
    pub usb_version: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    /// Device release (`bcdDevice`)
    pub version: Option<String>,
    pub serial: Option<String>,
}

/// Parse bus and device numbers from a platform device path
///
/// The last two `/`-separated components are taken as bus and device
/// number. Anything that does not parse yields `(0, 0)`.
pub fn parse_bus_device(name: &str) -> (u32, u32) {
    let mut parts = name.rsplit('/');
    let device = parts.next().and_then(|p| p.parse::<u32>().ok());
    let bus = parts.next().and_then(|p| p.parse::<u32>().ok());

    match (bus, device) {
        (Some(bus), Some(device)) => (bus, device),
        _ => (0, 0),
    }
}

/// Format a BCD release number (`0x0210` -> `"2.10"`)
pub fn format_bcd(bcd: u16) -> String {
    format!("{:x}.{:02x}", bcd >> 8, bcd & 0xff)
}
