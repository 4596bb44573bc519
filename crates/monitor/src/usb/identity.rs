//! Device identity keys
//!
//! A device identity key recognizes the same physical device across
//! re-attachment without relying on object identity. The string form is
//! nine `#`-separated slots followed by a trailing `#`:
//!
//! ```text
//! vendor#product#class#subclass#protocol#serial#manufacturer#configCount#version#
//! ```
//!
//! Every slot is always emitted, empty or not, so field boundaries cannot
//! shift. Vendor and product ids are decimal. Other tooling keys saved
//! device settings on this string, so the slot order must not change.
//!
//! The integer form is the 31-multiplier polynomial hash over the UTF-16
//! code units of the string, wrapping at 32 bits, the same value a JVM
//! `String.hashCode` gives for it.
//!
//! By default the key is model-level: two cameras of the same model and
//! firmware revision produce the same key. Pass [`KeyOptions::with_serial`]
//! or a serial override to tell them apart.

use common::UsbDevice;
use serde::{Deserialize, Serialize};
use std::fmt;

const DELIMITER: char = '#';

/// Which optional fields take part in the key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyOptions {
    /// Fill the serial slot from the device's own serial number
    #[serde(default)]
    pub with_serial: bool,
    /// Fill the manufacturer, configuration count and version slots
    #[serde(default)]
    pub extended: bool,
}

/// Identity key of a device
///
/// Equality and hashing use the full string, so two devices never share a
/// map entry because of a collision in the 32-bit form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceKey(String);

impl DeviceKey {
    /// Compute the key of `device`
    pub fn new(device: &UsbDevice, serial_override: Option<&str>, options: KeyOptions) -> Self {
        Self(key_name(device, serial_override, options))
    }

    /// The `#`-delimited string form
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The 32-bit integer form of the string form
    pub fn hash32(&self) -> i32 {
        key_hash(&self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Build the string form of a device key
///
/// A non-empty `serial_override` always fills the serial slot, typically
/// with the serial read from an opened connection.
pub fn key_name(device: &UsbDevice, serial_override: Option<&str>, options: KeyOptions) -> String {
    let serial = match serial_override.filter(|s| !s.is_empty()) {
        Some(serial) => serial.to_string(),
        None if options.with_serial => device.serial_number.clone().unwrap_or_default(),
        None => String::new(),
    };

    let (manufacturer, config_count, version) = if options.extended {
        (
            device.manufacturer_name.clone().unwrap_or_default(),
            device.configuration_count.to_string(),
            device.version.clone().unwrap_or_default(),
        )
    } else {
        (String::new(), String::new(), String::new())
    };

    let slots = [
        device.vendor_id.to_string(),
        device.product_id.to_string(),
        device.class.to_string(),
        device.subclass.to_string(),
        device.protocol.to_string(),
        serial,
        manufacturer,
        config_count,
        version,
    ];

    let mut name = String::with_capacity(64);
    for slot in &slots {
        name.push_str(slot);
        name.push(DELIMITER);
    }
    name
}

/// 32-bit integer form of a key string
pub fn key_hash(name: &str) -> i32 {
    name.encode_utf16()
        .fold(0i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(i32::from(unit)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{create_mock_camera, create_mock_device};

    #[test]
    fn test_default_key_layout() {
        let device = create_mock_device(1, 0x1234, 0x5678);
        let name = key_name(&device, None, KeyOptions::default());

        assert_eq!(name, "4660#22136#0#0#0#####");
        assert_eq!(name.matches(DELIMITER).count(), 9);
    }

    #[test]
    fn test_key_is_deterministic() {
        let device = create_mock_camera(2, 0x2bdf, 0x0101);
        let options = KeyOptions {
            with_serial: true,
            extended: true,
        };

        let first = DeviceKey::new(&device, None, options);
        let second = DeviceKey::new(&device.clone(), None, options);

        assert_eq!(first, second);
        assert_eq!(first.hash32(), second.hash32());
        assert_eq!(key_hash("4660#22136#0#0#0#####"), key_hash("4660#22136#0#0#0#####"));
    }

    #[test]
    fn test_key_hash_values() {
        assert_eq!(key_hash(""), 0);
        assert_eq!(key_hash("abc"), 96354);
        assert_eq!(key_hash("4660#22136#0#0#0#####"), 571862159);
        assert_eq!(key_hash("11231#257#239#2#1#SN000004####"), -2131562513);
    }

    #[test]
    fn test_same_model_shares_default_key() {
        let a = create_mock_camera(2, 0x2bdf, 0x0101);
        let b = create_mock_camera(3, 0x2bdf, 0x0101);
        assert_ne!(a.serial_number, b.serial_number);

        let default = KeyOptions::default();
        assert_eq!(DeviceKey::new(&a, None, default), DeviceKey::new(&b, None, default));

        let serial = KeyOptions {
            with_serial: true,
            extended: false,
        };
        assert_ne!(DeviceKey::new(&a, None, serial), DeviceKey::new(&b, None, serial));
    }

    #[test]
    fn test_serial_override_fills_serial_slot() {
        let device = create_mock_device(1, 0x1234, 0x5678);

        let name = key_name(&device, Some("ABC"), KeyOptions::default());
        assert_eq!(name, "4660#22136#0#0#0#ABC####");

        let empty_override = key_name(&device, Some(""), KeyOptions::default());
        assert_eq!(empty_override, "4660#22136#0#0#0#####");
    }

    #[test]
    fn test_extended_fields() {
        let device = create_mock_camera(5, 0x2bdf, 0x0101);
        let name = key_name(
            &device,
            None,
            KeyOptions {
                with_serial: true,
                extended: true,
            },
        );

        assert_eq!(name, "11231#257#239#2#1#SN000005#Mock Optics#1#1.00#");
    }

    #[test]
    fn test_empty_fields_cannot_shift_boundaries() {
        let mut a = create_mock_device(1, 1, 1);
        a.manufacturer_name = Some("1".to_string());
        a.configuration_count = 0;
        let mut b = create_mock_device(1, 1, 1);
        b.manufacturer_name = None;
        b.configuration_count = 10;

        let extended = KeyOptions {
            with_serial: false,
            extended: true,
        };
        assert_ne!(key_name(&a, None, extended), key_name(&b, None, extended));
    }
}
