//! Test utilities for usb-monitor
//!
//! Provides mock device snapshots, raw descriptor builders and async test
//! helpers shared across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::create_mock_device;
//!
//! let device = create_mock_device(1, 0x1234, 0x5678);
//! assert_eq!(device.vendor_id, 0x1234);
//! assert_eq!(device.name, "/dev/bus/usb/001/001");
//! ```

use crate::usb_types::{UsbDevice, UsbInterface};
use std::future::Future;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a mock device with no interfaces and no strings
///
/// `address` becomes the device number in the platform path.
pub fn create_mock_device(address: u8, vendor_id: u16, product_id: u16) -> UsbDevice {
    UsbDevice {
        name: format!("/dev/bus/usb/001/{:03}", address),
        vendor_id,
        product_id,
        class: 0x00,
        subclass: 0x00,
        protocol: 0x00,
        serial_number: None,
        manufacturer_name: None,
        product_name: None,
        version: None,
        configuration_count: 1,
        interfaces: Vec::new(),
    }
}

/// Create a mock UVC camera (IAD composite with video control + streaming)
pub fn create_mock_camera(address: u8, vendor_id: u16, product_id: u16) -> UsbDevice {
    let mut device = create_mock_device(address, vendor_id, product_id);
    device.class = 0xef;
    device.subclass = 0x02;
    device.protocol = 0x01;
    device.manufacturer_name = Some("Mock Optics".to_string());
    device.product_name = Some(format!("Depth Camera {}", address));
    device.serial_number = Some(format!("SN{:06}", address));
    device.version = Some("1.00".to_string());
    device.interfaces = vec![
        create_mock_interface(0, 0, 0x0e, 0x01, 1),
        create_mock_interface(1, 0, 0x0e, 0x02, 0),
        create_mock_interface(1, 1, 0x0e, 0x02, 1),
    ];
    device
}

/// Create a mock interface alternate setting
pub fn create_mock_interface(
    id: u8,
    alternate_setting: u8,
    class: u8,
    subclass: u8,
    endpoint_count: u8,
) -> UsbInterface {
    UsbInterface {
        id,
        alternate_setting,
        class,
        subclass,
        protocol: 0x00,
        endpoint_count,
    }
}

/// Create a list of distinct mock devices
pub fn create_mock_device_list(count: u8) -> Vec<UsbDevice> {
    (1..=count)
        .map(|i| create_mock_device(i, 0x1000 + u16::from(i), 0x2000 + u16::from(i)))
        .collect()
}

/// Create a standard 18-byte device descriptor
///
/// String indices are 1 (manufacturer), 2 (product) and 3 (serial).
pub fn create_mock_device_descriptor(vendor_id: u16, product_id: u16) -> Vec<u8> {
    let [vid_lo, vid_hi] = vendor_id.to_le_bytes();
    let [pid_lo, pid_hi] = product_id.to_le_bytes();
    vec![
        0x12, // bLength
        0x01, // bDescriptorType (Device)
        0x00, 0x02, // bcdUSB (2.00)
        0x00, // bDeviceClass
        0x00, // bDeviceSubClass
        0x00, // bDeviceProtocol
        0x40, // bMaxPacketSize0 (64 bytes)
        vid_lo, vid_hi, // idVendor
        pid_lo, pid_hi, // idProduct
        0x00, 0x01, // bcdDevice (1.00)
        0x01, // iManufacturer
        0x02, // iProduct
        0x03, // iSerialNumber
        0x01, // bNumConfigurations
    ]
}

/// Create a string descriptor 0 listing the given language ids
pub fn create_mock_language_table(languages: &[u16]) -> Vec<u8> {
    let mut desc = vec![(2 + languages.len() * 2) as u8, 0x03];
    for lang in languages {
        desc.extend_from_slice(&lang.to_le_bytes());
    }
    desc
}

/// Create a UTF-16LE string descriptor
pub fn create_mock_string_descriptor(text: &str) -> Vec<u8> {
    let units: Vec<u16> = text.encode_utf16().collect();
    let mut desc = vec![(2 + units.len() * 2) as u8, 0x03];
    for unit in units {
        desc.extend_from_slice(&unit.to_le_bytes());
    }
    desc
}

/// Timeout wrapper for async tests
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}
