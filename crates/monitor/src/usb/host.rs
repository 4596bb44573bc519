//! Host platform seam
//!
//! The monitor never talks to libusb (or any other platform API) directly.
//! Enumeration, permission queries and prompts, opening native handles and
//! event delivery all go through [`UsbHost`]. Tests plug in the in-memory
//! host from [`crate::test_utils`].

use common::{EventSender, HostError, UsbDevice, UsbInterface};
use std::time::Duration;

/// Primitives the host platform provides
pub trait UsbHost: Send + Sync {
    /// Enumerate attached devices, unfiltered
    fn devices(&self) -> Result<Vec<UsbDevice>, HostError>;

    /// Live permission query
    fn has_permission(&self, device: &UsbDevice) -> bool;

    /// Issue a permission prompt
    ///
    /// Returns once the prompt is issued. The answer arrives later as a
    /// `HostEvent::PermissionResult` on the sender given to [`UsbHost::watch`].
    fn request_permission(&self, device: &UsbDevice) -> Result<(), HostError>;

    /// Open a native handle. May block briefly.
    fn open(&self, device: &UsbDevice) -> Result<Box<dyn NativeConnection>, HostError>;

    /// Start delivering events to `events`; dropping the watch stops delivery
    fn watch(&self, events: EventSender) -> Result<Box<dyn EventWatch>, HostError>;
}

/// An open native device handle
pub trait NativeConnection: Send {
    /// OS file descriptor backing the handle, when the platform exposes one
    fn file_descriptor(&self) -> Option<i32>;

    /// Raw descriptor bytes, starting with the 18-byte device descriptor
    fn raw_descriptors(&self) -> Result<Vec<u8>, HostError>;

    /// Serial number as read through the open handle
    fn serial(&self) -> Option<String>;

    /// Claim an interface; `force` detaches a kernel driver bound to it
    fn claim_interface(&mut self, interface: &UsbInterface, force: bool) -> Result<(), HostError>;

    fn release_interface(&mut self, interface: &UsbInterface) -> Result<(), HostError>;

    /// Device-to-host control transfer, returning the number of bytes read
    fn control_in(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, HostError>;

    /// Release the native handle
    fn close(&mut self) -> Result<(), HostError>;
}

/// Active event delivery; stops when dropped
pub trait EventWatch: Send {}
