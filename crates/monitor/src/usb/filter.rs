//! Device filters
//!
//! A filter is a predicate with a polarity. A filter list is evaluated in
//! order and the first matching filter decides: include, or exclude. A
//! device no filter matches is not selected. An empty list selects every
//! device.

use common::UsbDevice;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Predicate over device descriptors
///
/// Unset fields match anything. The class triple matches either the
/// device-level codes or any interface, since composite devices (UVC
/// cameras among them) report their function class per interface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFilter {
    #[serde(default)]
    pub vendor_id: Option<u16>,
    #[serde(default)]
    pub product_id: Option<u16>,
    #[serde(default)]
    pub class: Option<u8>,
    #[serde(default)]
    pub subclass: Option<u8>,
    #[serde(default)]
    pub protocol: Option<u8>,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub serial: Option<String>,
    /// A match excludes the device instead of selecting it
    #[serde(default)]
    pub exclude: bool,
}

impl DeviceFilter {
    /// Filter on vendor and optionally product id
    pub fn vendor_product(vendor_id: u16, product_id: Option<u16>) -> Self {
        Self {
            vendor_id: Some(vendor_id),
            product_id,
            ..Self::default()
        }
    }

    /// Filter on a class code, device-level or per interface
    pub fn class(class: u8) -> Self {
        Self {
            class: Some(class),
            ..Self::default()
        }
    }

    /// Turn this filter into an exclusion
    pub fn excluding(mut self) -> Self {
        self.exclude = true;
        self
    }

    /// Whether `device` satisfies every set field
    pub fn matches(&self, device: &UsbDevice) -> bool {
        if self.vendor_id.is_some_and(|v| v != device.vendor_id) {
            return false;
        }
        if self.product_id.is_some_and(|p| p != device.product_id) {
            return false;
        }
        if !string_matches(&self.manufacturer, &device.manufacturer_name)
            || !string_matches(&self.product, &device.product_name)
            || !string_matches(&self.serial, &device.serial_number)
        {
            return false;
        }

        if self.class.is_none() && self.subclass.is_none() && self.protocol.is_none() {
            return true;
        }

        self.class_matches(device.class, device.subclass, device.protocol)
            || device
                .interfaces
                .iter()
                .any(|i| self.class_matches(i.class, i.subclass, i.protocol))
    }

    fn class_matches(&self, class: u8, subclass: u8, protocol: u8) -> bool {
        self.class.is_none_or(|c| c == class)
            && self.subclass.is_none_or(|s| s == subclass)
            && self.protocol.is_none_or(|p| p == protocol)
    }
}

fn string_matches(expected: &Option<String>, actual: &Option<String>) -> bool {
    match expected {
        None => true,
        Some(expected) => actual.as_deref() == Some(expected.as_str()),
    }
}

/// Whether `device` is selected by `filters`
pub fn is_selected(filters: &[DeviceFilter], device: &UsbDevice) -> bool {
    if filters.is_empty() {
        return true;
    }

    filters
        .iter()
        .find(|f| f.matches(device))
        .is_some_and(|f| !f.exclude)
}

/// Keep the devices selected by `filters`, preserving order
pub fn select(filters: &[DeviceFilter], devices: Vec<UsbDevice>) -> Vec<UsbDevice> {
    devices
        .into_iter()
        .filter(|d| is_selected(filters, d))
        .collect()
}

/// Error parsing the textual filter form
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct FilterParseError(String);

/// Textual form: `VID:PID`, each `0x`-prefixed hex or `*`, with an
/// optional leading `!` for an exclusion (`0x1234:*`, `!0x1d6b:*`).
impl FromStr for DeviceFilter {
    type Err = FilterParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (exclude, body) = match trimmed.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };

        let parts: Vec<&str> = body.split(':').collect();
        if parts.len() != 2 {
            return Err(FilterParseError(format!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')",
                s
            )));
        }

        Ok(Self {
            vendor_id: parse_hex_id(parts[0], "VID")?,
            product_id: parse_hex_id(parts[1], "PID")?,
            exclude,
            ..Self::default()
        })
    }
}

fn parse_hex_id(id: &str, name: &str) -> Result<Option<u16>, FilterParseError> {
    if id == "*" {
        return Ok(None);
    }

    let hex_part = id
        .strip_prefix("0x")
        .or_else(|| id.strip_prefix("0X"))
        .ok_or_else(|| {
            FilterParseError(format!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
                name, id
            ))
        })?;

    if hex_part.is_empty() || hex_part.len() > 4 {
        return Err(FilterParseError(format!(
            "Invalid {} '{}', hex part must be 1-4 digits",
            name, id
        )));
    }

    u16::from_str_radix(hex_part, 16)
        .map(Some)
        .map_err(|_| FilterParseError(format!("Invalid {} '{}', not a valid hex number", name, id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{create_mock_camera, create_mock_device};

    #[test]
    fn test_empty_filter_list_selects_all() {
        let device = create_mock_device(1, 0x1234, 0x5678);
        assert!(is_selected(&[], &device));
    }

    #[test]
    fn test_first_match_wins() {
        let device = create_mock_device(1, 0x1234, 0x5678);

        let exclude_first = vec![
            DeviceFilter::vendor_product(0x1234, None).excluding(),
            DeviceFilter::vendor_product(0x1234, Some(0x5678)),
        ];
        assert!(!is_selected(&exclude_first, &device));

        let include_first = vec![
            DeviceFilter::vendor_product(0x1234, Some(0x5678)),
            DeviceFilter::vendor_product(0x1234, None).excluding(),
        ];
        assert!(is_selected(&include_first, &device));
    }

    #[test]
    fn test_no_match_is_not_selected() {
        let device = create_mock_device(1, 0x1234, 0x5678);
        let filters = vec![DeviceFilter::vendor_product(0xabcd, None)];

        assert!(!is_selected(&filters, &device));
    }

    #[test]
    fn test_exclusion_only_list_selects_nothing() {
        let device = create_mock_device(1, 0x1234, 0x5678);
        let filters = vec![DeviceFilter::vendor_product(0xabcd, None).excluding()];

        assert!(!is_selected(&filters, &device));
    }

    #[test]
    fn test_class_matches_interface() {
        let camera = create_mock_camera(2, 0x2bdf, 0x0101);
        let video = DeviceFilter::class(0x0e);
        let mass_storage = DeviceFilter::class(0x08);

        assert!(video.matches(&camera));
        assert!(!mass_storage.matches(&camera));
    }

    #[test]
    fn test_string_fields_must_match() {
        let camera = create_mock_camera(2, 0x2bdf, 0x0101);
        let by_serial = DeviceFilter {
            serial: Some("SN000002".to_string()),
            ..DeviceFilter::default()
        };
        let other_serial = DeviceFilter {
            serial: Some("SN999999".to_string()),
            ..DeviceFilter::default()
        };

        assert!(by_serial.matches(&camera));
        assert!(!other_serial.matches(&camera));
        assert!(!by_serial.matches(&create_mock_device(2, 0x2bdf, 0x0101)));
    }

    #[test]
    fn test_select_preserves_order() {
        let devices = vec![
            create_mock_device(1, 0x1111, 1),
            create_mock_device(2, 0x2222, 1),
            create_mock_device(3, 0x1111, 2),
        ];
        let filters = vec![DeviceFilter::vendor_product(0x1111, None)];

        let selected = select(&filters, devices);
        let addresses: Vec<_> = selected.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(addresses, vec!["/dev/bus/usb/001/001", "/dev/bus/usb/001/003"]);
    }

    #[test]
    fn test_parse_filter() {
        assert_eq!(
            "0x1234:0x5678".parse::<DeviceFilter>().unwrap(),
            DeviceFilter::vendor_product(0x1234, Some(0x5678))
        );
        assert_eq!(
            "0xABCD:*".parse::<DeviceFilter>().unwrap(),
            DeviceFilter::vendor_product(0xabcd, None)
        );
        assert_eq!(
            "!0x1d6b:*".parse::<DeviceFilter>().unwrap(),
            DeviceFilter::vendor_product(0x1d6b, None).excluding()
        );
        assert_eq!("*:*".parse::<DeviceFilter>().unwrap(), DeviceFilter::default());
    }

    #[test]
    fn test_parse_filter_invalid() {
        assert!("1234:5678".parse::<DeviceFilter>().is_err());
        assert!("0x1234".parse::<DeviceFilter>().is_err());
        assert!("0x1234:0x5678:0x9abc".parse::<DeviceFilter>().is_err());
        assert!("0xGHIJ:0x5678".parse::<DeviceFilter>().is_err());
        assert!("0x12345:0x5678".parse::<DeviceFilter>().is_err());
    }

    #[test]
    fn test_parse_error_message() {
        let err = "0xGHIJ:*".parse::<DeviceFilter>().unwrap_err();
        let boxed: Box<dyn std::error::Error> = Box::new(err.clone());

        assert!(err.to_string().contains("not a valid hex number"));
        assert_eq!(boxed.to_string(), err.to_string());
    }
}
