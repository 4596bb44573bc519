//! String descriptor and device info reading
//!
//! Platform-provided strings win. With an open connection, missing fields
//! are filled from the raw device descriptor and from string descriptors
//! fetched with standard GET_DESCRIPTOR control transfers, trying every
//! language the device advertises until one decodes cleanly.

use crate::usb::host::NativeConnection;
use common::{DeviceInfo, UsbDevice, format_bcd};
use std::time::Duration;
use tracing::debug;

/// bmRequestType: device-to-host, standard, device recipient
pub const USB_REQ_STANDARD_DEVICE_GET: u8 = 0x80;
/// bRequest: GET_DESCRIPTOR
pub const USB_REQ_GET_DESCRIPTOR: u8 = 0x06;
/// Descriptor type: STRING
pub const USB_DT_STRING: u8 = 0x03;

const DESCRIPTOR_BUFFER_SIZE: usize = 256;
const STRING_TIMEOUT: Duration = Duration::from_secs(1);

/// Some devices answer a string request with the language id 0x0409
/// decoded as text.
const GARBAGE_STRING: &str = "\u{0409}";

/// Collect manufacturer, product, serial and version strings for `device`
pub fn read_device_info(device: &UsbDevice, connection: Option<&dyn NativeConnection>) -> DeviceInfo {
    let mut info = DeviceInfo {
        usb_version: None,
        manufacturer: non_empty(device.manufacturer_name.clone()),
        product: non_empty(device.product_name.clone()),
        version: non_empty(device.version.clone()),
        serial: non_empty(device.serial_number.clone()),
    };

    if let Some(connection) = connection {
        fill_from_connection(&mut info, connection);
    }

    if info.manufacturer.is_none() {
        info.manufacturer = Some(format!("{:04x}", device.vendor_id));
    }
    if info.product.is_none() {
        info.product = Some(format!("{:04x}", device.product_id));
    }

    info
}

fn fill_from_connection(info: &mut DeviceInfo, connection: &dyn NativeConnection) {
    let raw = match connection.raw_descriptors() {
        Ok(raw) if raw.len() >= 18 => raw,
        Ok(raw) => {
            debug!("Raw descriptor too short ({} bytes)", raw.len());
            return;
        }
        Err(e) => {
            debug!("Could not read raw descriptors: {}", e);
            return;
        }
    };

    if info.usb_version.is_none() {
        info.usb_version = Some(format_bcd(u16::from_le_bytes([raw[2], raw[3]])));
    }
    if info.version.is_none() {
        info.version = Some(format_bcd(u16::from_le_bytes([raw[12], raw[13]])));
    }
    if info.serial.is_none() {
        info.serial = non_empty(connection.serial());
    }

    let languages = read_languages(connection);
    if languages.is_empty() {
        return;
    }

    if info.manufacturer.is_none() {
        info.manufacturer = read_string(connection, raw[14], &languages);
    }
    if info.product.is_none() {
        info.product = read_string(connection, raw[15], &languages);
    }
    if info.serial.is_none() {
        info.serial = read_string(connection, raw[16], &languages);
    }
}

/// Read the language id table (string descriptor 0)
pub fn read_languages(connection: &dyn NativeConnection) -> Vec<u16> {
    let mut buf = [0u8; DESCRIPTOR_BUFFER_SIZE];
    let len = match connection.control_in(
        USB_REQ_STANDARD_DEVICE_GET,
        USB_REQ_GET_DESCRIPTOR,
        u16::from(USB_DT_STRING) << 8,
        0,
        &mut buf,
        STRING_TIMEOUT,
    ) {
        Ok(len) => len.min(buf.len()),
        Err(e) => {
            debug!("Could not read language table: {}", e);
            return Vec::new();
        }
    };

    if len < 4 {
        return Vec::new();
    }

    buf[2..len]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Read string descriptor `index`, trying each language in turn
///
/// Index 0 means the device has no such string.
pub fn read_string(connection: &dyn NativeConnection, index: u8, languages: &[u16]) -> Option<String> {
    if index == 0 {
        return None;
    }

    let mut buf = [0u8; DESCRIPTOR_BUFFER_SIZE];
    for &language in languages {
        let len = match connection.control_in(
            USB_REQ_STANDARD_DEVICE_GET,
            USB_REQ_GET_DESCRIPTOR,
            (u16::from(USB_DT_STRING) << 8) | u16::from(index),
            language,
            &mut buf,
            STRING_TIMEOUT,
        ) {
            Ok(len) => len.min(buf.len()),
            Err(e) => {
                debug!("String {} in language {:#06x} failed: {}", index, language, e);
                continue;
            }
        };

        if len <= 2 || usize::from(buf[0]) != len || buf[1] != USB_DT_STRING {
            debug!("Malformed string descriptor {} ({} bytes)", index, len);
            continue;
        }

        let units: Vec<u16> = buf[2..len]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        match String::from_utf16(&units) {
            Ok(text) if text != GARBAGE_STRING => return Some(text),
            Ok(_) => debug!("Garbage reply for string {}, trying next language", index),
            Err(_) => debug!("Invalid UTF-16 in string {}", index),
        }
    }

    None
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{
        create_mock_device, create_mock_device_descriptor, create_mock_language_table,
        create_mock_string_descriptor,
    };
    use common::{HostError, UsbInterface};
    use std::collections::HashMap;

    /// Connection answering string requests from a (index, language) table
    struct ScriptedConnection {
        raw: Vec<u8>,
        languages: Vec<u8>,
        strings: HashMap<(u8, u16), Vec<u8>>,
    }

    impl NativeConnection for ScriptedConnection {
        fn file_descriptor(&self) -> Option<i32> {
            None
        }

        fn raw_descriptors(&self) -> Result<Vec<u8>, HostError> {
            Ok(self.raw.clone())
        }

        fn serial(&self) -> Option<String> {
            None
        }

        fn claim_interface(&mut self, _: &UsbInterface, _: bool) -> Result<(), HostError> {
            Ok(())
        }

        fn release_interface(&mut self, _: &UsbInterface) -> Result<(), HostError> {
            Ok(())
        }

        fn control_in(
            &self,
            _request_type: u8,
            _request: u8,
            value: u16,
            index: u16,
            buf: &mut [u8],
            _timeout: Duration,
        ) -> Result<usize, HostError> {
            let string_index = (value & 0xff) as u8;
            let reply = if string_index == 0 {
                &self.languages
            } else {
                self.strings
                    .get(&(string_index, index))
                    .ok_or(HostError::Other("stall".to_string()))?
            };
            buf[..reply.len()].copy_from_slice(reply);
            Ok(reply.len())
        }

        fn close(&mut self) -> Result<(), HostError> {
            Ok(())
        }
    }

    fn connection(strings: HashMap<(u8, u16), Vec<u8>>, languages: &[u16]) -> ScriptedConnection {
        ScriptedConnection {
            raw: create_mock_device_descriptor(0x1234, 0x5678),
            languages: create_mock_language_table(languages),
            strings,
        }
    }

    #[test]
    fn test_reads_strings_and_versions() {
        let mut strings = HashMap::new();
        strings.insert((1, 0x0409), create_mock_string_descriptor("Silead"));
        strings.insert((2, 0x0409), create_mock_string_descriptor("ToF Camera"));
        strings.insert((3, 0x0409), create_mock_string_descriptor("0001"));
        let conn = connection(strings, &[0x0409]);

        let info = read_device_info(&create_mock_device(1, 0x1234, 0x5678), Some(&conn as &dyn NativeConnection));

        assert_eq!(info.manufacturer.as_deref(), Some("Silead"));
        assert_eq!(info.product.as_deref(), Some("ToF Camera"));
        assert_eq!(info.serial.as_deref(), Some("0001"));
        assert_eq!(info.usb_version.as_deref(), Some("2.00"));
        assert_eq!(info.version.as_deref(), Some("1.00"));
    }

    #[test]
    fn test_garbage_reply_retries_next_language() {
        let mut strings = HashMap::new();
        strings.insert((1, 0x0409), create_mock_string_descriptor("\u{0409}"));
        strings.insert((1, 0x0407), create_mock_string_descriptor("Hersteller"));
        let conn = connection(strings, &[0x0409, 0x0407]);

        assert_eq!(
            read_string(&conn, 1, &read_languages(&conn)).as_deref(),
            Some("Hersteller")
        );
    }

    #[test]
    fn test_length_mismatch_is_skipped() {
        let mut bad = create_mock_string_descriptor("Broken");
        bad[0] = 0x40;
        let mut strings = HashMap::new();
        strings.insert((2, 0x0409), bad);
        let conn = connection(strings, &[0x0409]);

        assert_eq!(read_string(&conn, 2, &[0x0409]), None);
    }

    #[test]
    fn test_falls_back_to_hex_ids() {
        let mut strings = HashMap::new();
        strings.insert((1, 0x0409), create_mock_string_descriptor("\u{0409}"));
        let conn = connection(strings, &[0x0409]);

        let info = read_device_info(&create_mock_device(1, 0x1234, 0x5678), Some(&conn as &dyn NativeConnection));

        assert_eq!(info.manufacturer.as_deref(), Some("1234"));
        assert_eq!(info.product.as_deref(), Some("5678"));
        assert_eq!(info.serial, None);
    }

    #[test]
    fn test_platform_strings_win() {
        let mut device = create_mock_device(1, 0x1234, 0x5678);
        device.manufacturer_name = Some("Platform".to_string());
        device.product_name = Some(String::new());

        let info = read_device_info(&device, None);

        assert_eq!(info.manufacturer.as_deref(), Some("Platform"));
        assert_eq!(info.product.as_deref(), Some("5678"));
        assert_eq!(info.usb_version, None);
    }

    #[test]
    fn test_index_zero_is_not_requested() {
        let conn = connection(HashMap::new(), &[0x0409]);
        assert_eq!(read_string(&conn, 0, &[0x0409]), None);
    }
}
