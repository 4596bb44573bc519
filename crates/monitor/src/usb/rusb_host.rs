//! libusb host backend
//!
//! Desktop hosts have no permission prompt: access is whatever the devnode
//! allows. `request_permission` therefore answers at once with the live
//! check, delivered through the event channel like a real prompt answer.
//!
//! Hot-plug runs on its own `usb-hotplug` thread. libusb forbids synchronous
//! descriptor reads inside a hotplug callback, so the callback only records
//! the device and the thread builds snapshots once `handle_events` returns.

use crate::usb::host::{EventWatch, NativeConnection, UsbHost};
use common::{EventSender, HostError, UsbDevice, UsbInterface, format_bcd, parse_bus_device};
use rusb::{Context, Device, DeviceDescriptor, DeviceHandle, Hotplug, HotplugBuilder, UsbContext};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

const EVENT_POLL_TIMEOUT: Duration = Duration::from_millis(100);
const DESCRIPTOR_TIMEOUT: Duration = Duration::from_secs(1);

/// Root hubs are VID 0x1d6b (Linux Foundation) with device class 9 (Hub)
const ROOT_HUB_VENDOR_ID: u16 = 0x1d6b;
const HUB_CLASS: u8 = 0x09;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Map rusb errors to host errors
pub fn map_rusb_error(err: rusb::Error) -> HostError {
    match err {
        rusb::Error::Timeout => HostError::Timeout,
        rusb::Error::NoDevice | rusb::Error::NotFound => HostError::NoDevice,
        rusb::Error::Busy => HostError::Busy,
        rusb::Error::Access => HostError::Access,
        rusb::Error::NotSupported => HostError::NotSupported,
        _ => HostError::Other(err.to_string()),
    }
}

/// Linux devnode path for a bus/address pair
pub fn device_path(bus: u8, address: u8) -> String {
    format!("/dev/bus/usb/{:03}/{:03}", bus, address)
}

/// Re-encode an rusb version as the raw BCD word
pub fn version_bcd(version: rusb::Version) -> u16 {
    let major = u16::from(version.major());
    ((major / 10) << 12)
        | ((major % 10) << 8)
        | (u16::from(version.minor()) << 4)
        | u16::from(version.sub_minor())
}

fn is_root_hub(desc: &DeviceDescriptor) -> bool {
    desc.vendor_id() == ROOT_HUB_VENDOR_ID && desc.class_code() == HUB_CLASS
}

struct HostShared {
    context: Context,
    /// Snapshots by (bus, address), so a detach reports the device exactly
    /// as it was reported while attached
    known: Mutex<HashMap<(u8, u8), UsbDevice>>,
    /// Where permission answers and hot-plug events go while watched
    events: Mutex<Option<EventSender>>,
}

impl HostShared {
    /// Snapshot a device, reading strings when it can be opened
    fn snapshot(&self, device: &Device<Context>) -> Result<UsbDevice, rusb::Error> {
        let address = (device.bus_number(), device.address());
        let desc = device.device_descriptor()?;

        if let Some(known) = lock(&self.known).get(&address)
            && known.vendor_id == desc.vendor_id()
            && known.product_id == desc.product_id()
        {
            return Ok(known.clone());
        }

        let interfaces = match device.active_config_descriptor() {
            Ok(config) => config
                .interfaces()
                .flat_map(|interface| {
                    interface
                        .descriptors()
                        .map(|d| UsbInterface {
                            id: d.interface_number(),
                            alternate_setting: d.setting_number(),
                            class: d.class_code(),
                            subclass: d.sub_class_code(),
                            protocol: d.protocol_code(),
                            endpoint_count: d.num_endpoints(),
                        })
                        .collect::<Vec<_>>()
                })
                .collect(),
            Err(e) => {
                debug!("No active configuration for {:?}: {}", address, e);
                Vec::new()
            }
        };

        let (manufacturer_name, product_name, serial_number) = match device.open() {
            Ok(handle) => (
                handle.read_manufacturer_string_ascii(&desc).ok(),
                handle.read_product_string_ascii(&desc).ok(),
                handle.read_serial_number_string_ascii(&desc).ok(),
            ),
            Err(_) => (None, None, None),
        };

        let snapshot = UsbDevice {
            name: device_path(address.0, address.1),
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            class: desc.class_code(),
            subclass: desc.sub_class_code(),
            protocol: desc.protocol_code(),
            serial_number,
            manufacturer_name,
            product_name,
            version: Some(format_bcd(version_bcd(desc.device_version()))),
            configuration_count: desc.num_configurations(),
            interfaces,
        };

        lock(&self.known).insert(address, snapshot.clone());
        Ok(snapshot)
    }

    /// Drop the cached snapshot of a departed device
    fn forget(&self, device: &Device<Context>) -> Option<UsbDevice> {
        lock(&self.known).remove(&(device.bus_number(), device.address()))
    }

    fn find(&self, snapshot: &UsbDevice) -> Result<Device<Context>, HostError> {
        let (bus, address) = parse_bus_device(&snapshot.name);
        self.context
            .devices()
            .map_err(map_rusb_error)?
            .iter()
            .find(|d| u32::from(d.bus_number()) == bus && u32::from(d.address()) == address)
            .ok_or(HostError::NoDevice)
    }

    fn sender(&self) -> Option<EventSender> {
        lock(&self.events).clone()
    }
}

/// Host platform backed by libusb
#[derive(Clone)]
pub struct RusbHost {
    shared: Arc<HostShared>,
}

impl RusbHost {
    pub fn new() -> Result<Self, HostError> {
        let context = Context::new().map_err(map_rusb_error)?;
        Ok(Self {
            shared: Arc::new(HostShared {
                context,
                known: Mutex::new(HashMap::new()),
                events: Mutex::new(None),
            }),
        })
    }
}

impl UsbHost for RusbHost {
    fn devices(&self) -> Result<Vec<UsbDevice>, HostError> {
        let list = self.shared.context.devices().map_err(map_rusb_error)?;

        let mut devices = Vec::new();
        let mut present = HashSet::new();
        for device in list.iter() {
            match device.device_descriptor() {
                Ok(desc) if is_root_hub(&desc) => {
                    debug!(
                        "Skipping root hub: bus={}, addr={}",
                        device.bus_number(),
                        device.address()
                    );
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Failed to read device descriptor: {}", e);
                    continue;
                }
            }

            match self.shared.snapshot(&device) {
                Ok(snapshot) => {
                    present.insert((device.bus_number(), device.address()));
                    devices.push(snapshot);
                }
                Err(e) => warn!("Failed to snapshot device: {}", e),
            }
        }

        lock(&self.shared.known).retain(|address, _| present.contains(address));
        Ok(devices)
    }

    #[cfg(target_os = "linux")]
    fn has_permission(&self, device: &UsbDevice) -> bool {
        use nix::unistd::{AccessFlags, access};

        access(device.name.as_str(), AccessFlags::R_OK | AccessFlags::W_OK).is_ok()
    }

    #[cfg(not(target_os = "linux"))]
    fn has_permission(&self, device: &UsbDevice) -> bool {
        self.shared
            .find(device)
            .and_then(|d| d.open().map_err(map_rusb_error))
            .is_ok()
    }

    fn request_permission(&self, device: &UsbDevice) -> Result<(), HostError> {
        let sender = self.shared.sender().ok_or(HostError::NotSupported)?;
        let granted = self.has_permission(device);
        debug!("Permission for {} is {}", device.name, granted);
        sender
            .permission_result(device.clone(), granted)
            .map_err(|e| HostError::Other(e.to_string()))
    }

    fn open(&self, device: &UsbDevice) -> Result<Box<dyn NativeConnection>, HostError> {
        let found = self.shared.find(device)?;
        let descriptor = found.device_descriptor().map_err(map_rusb_error)?;
        let handle = found.open().map_err(|e| {
            warn!("Failed to open {}: {}", device.name, e);
            map_rusb_error(e)
        })?;

        Ok(Box::new(RusbConnection {
            handle: Some(handle),
            descriptor,
            detached: HashSet::new(),
        }))
    }

    fn watch(&self, events: EventSender) -> Result<Box<dyn EventWatch>, HostError> {
        *lock(&self.shared.events) = Some(events);

        if !rusb::has_hotplug() {
            info!("libusb has no hot-plug support, attach detection relies on polling");
            return Ok(Box::new(RusbWatch {
                shared: Arc::clone(&self.shared),
                stop: Arc::new(AtomicBool::new(false)),
                thread: None,
            }));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let thread = spawn_hotplug(Arc::clone(&self.shared), Arc::clone(&stop))
            .map_err(|e| HostError::Other(e.to_string()))?;

        Ok(Box::new(RusbWatch {
            shared: Arc::clone(&self.shared),
            stop,
            thread: Some(thread),
        }))
    }
}

/// Hot-plug thread handle; stops the thread and event delivery on drop
struct RusbWatch {
    shared: Arc<HostShared>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl EventWatch for RusbWatch {}

impl Drop for RusbWatch {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("Hot-plug thread panicked");
        }
        lock(&self.shared.events).take();
    }
}

enum Notice {
    Arrived(Device<Context>),
    Left(Device<Context>),
}

/// Records notices; snapshots are taken outside the callback
struct HotplugCallback {
    notices: Arc<Mutex<Vec<Notice>>>,
}

impl Hotplug<Context> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        lock(&self.notices).push(Notice::Arrived(device));
    }

    fn device_left(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        lock(&self.notices).push(Notice::Left(device));
    }
}

fn spawn_hotplug(shared: Arc<HostShared>, stop: Arc<AtomicBool>) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("usb-hotplug".to_string())
        .spawn(move || {
            let notices = Arc::new(Mutex::new(Vec::new()));
            let callback: Box<dyn Hotplug<Context>> = Box::new(HotplugCallback {
                notices: Arc::clone(&notices),
            });
            let registration = match HotplugBuilder::new()
                .enumerate(false) // devices() already enumerates
                .register(&shared.context, callback)
            {
                Ok(registration) => registration,
                Err(e) => {
                    warn!("Hot-plug registration failed: {}", e);
                    return;
                }
            };
            debug!("Hot-plug callbacks registered");

            while !stop.load(Ordering::Acquire) {
                match shared.context.handle_events(Some(EVENT_POLL_TIMEOUT)) {
                    Ok(()) => {}
                    Err(rusb::Error::Interrupted) => debug!("USB event handling interrupted"),
                    Err(e) => {
                        warn!("Error handling USB events: {}", e);
                        std::thread::sleep(EVENT_POLL_TIMEOUT);
                    }
                }

                let pending = std::mem::take(&mut *lock(&notices));
                for notice in pending {
                    deliver(&shared, notice);
                }
            }

            drop(registration);
            debug!("Hot-plug thread stopped");
        })
}

fn deliver(shared: &HostShared, notice: Notice) {
    let Some(sender) = shared.sender() else {
        return;
    };

    let result = match notice {
        Notice::Arrived(device) => {
            if device.device_descriptor().is_ok_and(|d| is_root_hub(&d)) {
                return;
            }
            match shared.snapshot(&device) {
                Ok(snapshot) => sender.attached(snapshot),
                Err(e) => {
                    warn!("Failed to snapshot arrived device: {}", e);
                    return;
                }
            }
        }
        Notice::Left(device) => {
            let snapshot = match shared.forget(&device) {
                Some(snapshot) => snapshot,
                None => match minimal_snapshot(&device) {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        warn!("Departed device has no descriptor: {}", e);
                        return;
                    }
                },
            };
            sender.detached(snapshot)
        }
    };

    if let Err(e) = result {
        warn!("Failed to deliver hot-plug event: {}", e);
    }
}

/// Snapshot from the cached descriptor alone, for devices already gone
fn minimal_snapshot(device: &Device<Context>) -> Result<UsbDevice, rusb::Error> {
    let desc = device.device_descriptor()?;
    Ok(UsbDevice {
        name: device_path(device.bus_number(), device.address()),
        vendor_id: desc.vendor_id(),
        product_id: desc.product_id(),
        class: desc.class_code(),
        subclass: desc.sub_class_code(),
        protocol: desc.protocol_code(),
        serial_number: None,
        manufacturer_name: None,
        product_name: None,
        version: Some(format_bcd(version_bcd(desc.device_version()))),
        configuration_count: desc.num_configurations(),
        interfaces: Vec::new(),
    })
}

/// Open libusb device handle
pub struct RusbConnection {
    /// `None` once closed
    handle: Option<DeviceHandle<Context>>,
    descriptor: DeviceDescriptor,
    /// Interfaces whose kernel driver we detached
    detached: HashSet<u8>,
}

impl RusbConnection {
    fn handle(&self) -> Result<&DeviceHandle<Context>, HostError> {
        self.handle.as_ref().ok_or(HostError::NoDevice)
    }

    fn read_descriptor(&self, value: u16, buf: &mut [u8]) -> Result<usize, HostError> {
        self.handle()?
            .read_control(0x80, 0x06, value, 0, buf, DESCRIPTOR_TIMEOUT)
            .map_err(map_rusb_error)
    }
}

impl NativeConnection for RusbConnection {
    /// libusb does not expose the descriptor of the devnode it opened
    fn file_descriptor(&self) -> Option<i32> {
        None
    }

    fn raw_descriptors(&self) -> Result<Vec<u8>, HostError> {
        let mut device = [0u8; 18];
        let len = self.read_descriptor(0x0100, &mut device)?;
        let mut raw = device[..len].to_vec();

        let mut header = [0u8; 9];
        if let Ok(9) = self.read_descriptor(0x0200, &mut header) {
            let total = usize::from(u16::from_le_bytes([header[2], header[3]]));
            let mut config = vec![0u8; total.max(9)];
            match self.read_descriptor(0x0200, &mut config) {
                Ok(len) => raw.extend_from_slice(&config[..len]),
                Err(e) => debug!("Could not read configuration descriptor: {}", e),
            }
        }

        Ok(raw)
    }

    fn serial(&self) -> Option<String> {
        self.handle()
            .ok()?
            .read_serial_number_string_ascii(&self.descriptor)
            .ok()
    }

    fn claim_interface(&mut self, interface: &UsbInterface, force: bool) -> Result<(), HostError> {
        let id = interface.id;
        let handle = self.handle.as_mut().ok_or(HostError::NoDevice)?;

        if force {
            match handle.kernel_driver_active(id) {
                Ok(true) => {
                    debug!("Detaching kernel driver from interface {}", id);
                    handle.detach_kernel_driver(id).map_err(map_rusb_error)?;
                    self.detached.insert(id);
                }
                Ok(false) => {}
                Err(e) => debug!("Could not check kernel driver on interface {}: {}", id, e),
            }
        }

        handle.claim_interface(id).map_err(map_rusb_error)?;
        if interface.alternate_setting != 0 {
            handle
                .set_alternate_setting(id, interface.alternate_setting)
                .map_err(map_rusb_error)?;
        }
        Ok(())
    }

    fn release_interface(&mut self, interface: &UsbInterface) -> Result<(), HostError> {
        let id = interface.id;
        let handle = self.handle.as_mut().ok_or(HostError::NoDevice)?;

        handle.release_interface(id).map_err(map_rusb_error)?;
        if self.detached.remove(&id) {
            if let Err(e) = handle.attach_kernel_driver(id) {
                debug!("Could not reattach kernel driver to interface {}: {}", id, e);
            } else {
                debug!("Reattached kernel driver to interface {}", id);
            }
        }
        Ok(())
    }

    fn control_in(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, HostError> {
        self.handle()?
            .read_control(request_type, request, value, index, buf, timeout)
            .map_err(map_rusb_error)
    }

    fn close(&mut self) -> Result<(), HostError> {
        let Some(mut handle) = self.handle.take() else {
            return Ok(());
        };
        for id in self.detached.drain() {
            if let Err(e) = handle.attach_kernel_driver(id) {
                debug!("Could not reattach kernel driver to interface {}: {}", id, e);
            }
        }
        drop(handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(map_rusb_error(rusb::Error::Timeout), HostError::Timeout);
        assert_eq!(map_rusb_error(rusb::Error::NoDevice), HostError::NoDevice);
        assert_eq!(map_rusb_error(rusb::Error::NotFound), HostError::NoDevice);
        assert_eq!(map_rusb_error(rusb::Error::Busy), HostError::Busy);
        assert_eq!(map_rusb_error(rusb::Error::Access), HostError::Access);
        assert!(matches!(
            map_rusb_error(rusb::Error::Pipe),
            HostError::Other(_)
        ));
    }

    #[test]
    fn test_device_path() {
        assert_eq!(device_path(1, 4), "/dev/bus/usb/001/004");
        assert_eq!(parse_bus_device(&device_path(3, 112)), (3, 112));
    }

    #[test]
    fn test_version_bcd() {
        assert_eq!(version_bcd(rusb::Version(2, 1, 0)), 0x0210);
        assert_eq!(version_bcd(rusb::Version(1, 0, 0)), 0x0100);
        assert_eq!(format_bcd(version_bcd(rusb::Version(12, 3, 4))), "12.34");
    }

    #[test]
    fn test_host_creation() {
        // May fail without libusb access
        match RusbHost::new() {
            Ok(host) => {
                let devices = host.devices().unwrap_or_default();
                assert!(
                    devices
                        .iter()
                        .all(|d| !(d.vendor_id == ROOT_HUB_VENDOR_ID && d.class == HUB_CLASS))
                );
            }
            Err(e) => eprintln!("USB host creation failed (expected without permissions): {}", e),
        }
    }
}
