//! Control block: exclusive owner of one open native device handle
//!
//! A control block is created only once permission is confirmed, holds the
//! native connection plus the interfaces claimed through it, and is closed
//! exactly once. After close every accessor fails with [`Error::Closed`].
//!
//! The native handle is only touched while holding the block's own lock, so
//! accessors are safe to call from any thread.

use crate::usb::descriptor::read_device_info;
use crate::usb::host::{NativeConnection, UsbHost};
use crate::usb::identity::{DeviceKey, KeyOptions};
use common::{DeviceInfo, Error, Result, UsbDevice, UsbInterface, parse_bus_device};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, info, warn};

/// Told when a block it owns has closed
///
/// The monitor implements this to fire `on_disconnect` and drop the pool
/// entry, whichever side initiated the close.
pub trait BlockOwner: Send + Sync {
    fn block_closed(&self, block: &ControlBlock);
}

struct InterfaceSlot {
    interface: UsbInterface,
    claimed: bool,
}

struct BlockInner {
    /// `None` once closed
    connection: Option<Box<dyn NativeConnection>>,
    /// (interface id, alternate setting) -> resolved interface
    interfaces: HashMap<(u8, u8), InterfaceSlot>,
}

/// One open native device handle and its claimed interfaces
pub struct ControlBlock {
    device: UsbDevice,
    key: DeviceKey,
    bus_number: u32,
    device_number: u32,
    info: DeviceInfo,
    closed: AtomicBool,
    inner: Mutex<BlockInner>,
    owner: Option<Weak<dyn BlockOwner>>,
    this: Weak<ControlBlock>,
}

impl ControlBlock {
    /// Open a native handle to `device`
    ///
    /// Permission must already be granted. `owner` is notified on close;
    /// independent blocks that live outside the pool pass `None`.
    pub fn open(
        host: &dyn UsbHost,
        device: &UsbDevice,
        key: DeviceKey,
        owner: Option<Weak<dyn BlockOwner>>,
    ) -> Result<Arc<Self>> {
        let connection = host.open(device)?;
        let info = read_device_info(device, Some(connection.as_ref()));
        let (bus_number, device_number) = parse_bus_device(&device.name);

        info!(
            "Opened {} (bus={}, dev={}, key={})",
            device.name, bus_number, device_number, key
        );

        Ok(Arc::new_cyclic(|this| Self {
            device: device.clone(),
            key,
            bus_number,
            device_number,
            info,
            closed: AtomicBool::new(false),
            inner: Mutex::new(BlockInner {
                connection: Some(connection),
                interfaces: HashMap::new(),
            }),
            owner,
            this: this.clone(),
        }))
    }

    fn lock(&self) -> MutexGuard<'_, BlockInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with the open connection, or fail with `Closed`
    fn with_open<R>(
        &self,
        f: impl FnOnce(&mut Box<dyn NativeConnection>, &mut HashMap<(u8, u8), InterfaceSlot>) -> Result<R>,
    ) -> Result<R> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        match inner.connection.as_mut() {
            Some(connection) => f(connection, &mut inner.interfaces),
            None => Err(Error::Closed),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Device snapshot this block was opened for
    pub fn device(&self) -> Result<&UsbDevice> {
        self.ensure_open()?;
        Ok(&self.device)
    }

    /// Identity key the block is pooled under
    pub fn key(&self) -> Result<&DeviceKey> {
        self.ensure_open()?;
        Ok(&self.key)
    }

    /// Key of this device with the serial read through the open handle
    pub fn key_with_serial(&self, options: KeyOptions) -> Result<DeviceKey> {
        self.ensure_open()?;
        Ok(DeviceKey::new(
            &self.device,
            self.info.serial.as_deref(),
            options,
        ))
    }

    pub fn bus_number(&self) -> Result<u32> {
        self.ensure_open()?;
        Ok(self.bus_number)
    }

    pub fn device_number(&self) -> Result<u32> {
        self.ensure_open()?;
        Ok(self.device_number)
    }

    /// Strings and versions read when the block opened
    pub fn info(&self) -> Result<&DeviceInfo> {
        self.ensure_open()?;
        Ok(&self.info)
    }

    pub fn serial(&self) -> Result<Option<String>> {
        self.ensure_open()?;
        Ok(self.info.serial.clone())
    }

    pub fn manufacturer(&self) -> Result<Option<String>> {
        self.ensure_open()?;
        Ok(self.info.manufacturer.clone())
    }

    pub fn product(&self) -> Result<Option<String>> {
        self.ensure_open()?;
        Ok(self.info.product.clone())
    }

    /// OS file descriptor of the native handle
    pub fn file_descriptor(&self) -> Result<Option<i32>> {
        self.with_open(|connection, _| Ok(connection.file_descriptor()))
    }

    /// Raw descriptor bytes read through the native handle
    pub fn raw_descriptors(&self) -> Result<Vec<u8>> {
        self.with_open(|connection, _| Ok(connection.raw_descriptors()?))
    }

    /// Resolve interface `id` at `alternate_setting`
    ///
    /// Resolved interfaces are cached; repeat calls return the cached entry.
    pub fn interface(&self, id: u8, alternate_setting: u8) -> Result<UsbInterface> {
        let device = &self.device;
        self.with_open(|_, interfaces| {
            let slot = resolve(interfaces, device, id, alternate_setting)?;
            Ok(slot.interface.clone())
        })
    }

    /// Claim interface `id` at `alternate_setting`
    ///
    /// `force` detaches a kernel driver bound to the interface.
    pub fn claim_interface(&self, id: u8, alternate_setting: u8, force: bool) -> Result<()> {
        let device = &self.device;
        self.with_open(|connection, interfaces| {
            let slot = resolve(interfaces, device, id, alternate_setting)?;
            if slot.claimed {
                return Ok(());
            }
            connection.claim_interface(&slot.interface, force)?;
            slot.claimed = true;
            debug!("Claimed interface {}/{} on {}", id, alternate_setting, device.name);
            Ok(())
        })
    }

    /// Release a claimed interface; releasing an unclaimed one is a no-op
    pub fn release_interface(&self, id: u8, alternate_setting: u8) -> Result<()> {
        let name = &self.device.name;
        self.with_open(|connection, interfaces| {
            let Some(slot) = interfaces.get_mut(&(id, alternate_setting)) else {
                return Ok(());
            };
            if slot.claimed {
                connection.release_interface(&slot.interface)?;
                slot.claimed = false;
                debug!("Released interface {}/{} on {}", id, alternate_setting, name);
            }
            Ok(())
        })
    }

    /// Number of interfaces currently claimed
    pub fn claimed_count(&self) -> Result<usize> {
        self.with_open(|_, interfaces| Ok(interfaces.values().filter(|s| s.claimed).count()))
    }

    /// Release claimed interfaces, close the handle and notify the owner
    ///
    /// Closing twice is a no-op. A failing native close is returned after
    /// the block is torn down anyway; the block is closed either way. The
    /// block reports closed from the moment the handle is taken, before the
    /// native close returns.
    pub fn close(&self) -> Result<()> {
        let result = {
            let mut inner = self.lock();
            let Some(mut connection) = inner.connection.take() else {
                return Ok(());
            };
            self.closed.store(true, Ordering::Release);

            for slot in inner.interfaces.values().filter(|s| s.claimed) {
                if let Err(e) = connection.release_interface(&slot.interface) {
                    warn!(
                        "Failed to release interface {}/{} on {}: {}",
                        slot.interface.id, slot.interface.alternate_setting, self.device.name, e
                    );
                }
            }
            inner.interfaces.clear();

            connection.close()
        };

        info!("Closed {} (key={})", self.device.name, self.key);

        if let Some(owner) = self.owner.as_ref().and_then(Weak::upgrade) {
            owner.block_closed(self);
        }

        result.map_err(Error::from)
    }

    /// Key and device without the closed check, for owners and logging
    pub(crate) fn identity(&self) -> (&DeviceKey, &UsbDevice) {
        (&self.key, &self.device)
    }

    /// Shared handle to this block, while any `Arc` to it is alive
    pub(crate) fn handle(&self) -> Option<Arc<ControlBlock>> {
        self.this.upgrade()
    }
}

impl std::fmt::Debug for ControlBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlBlock")
            .field("device", &self.device.name)
            .field("key", &self.key)
            .field("bus_number", &self.bus_number)
            .field("device_number", &self.device_number)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn resolve<'a>(
    interfaces: &'a mut HashMap<(u8, u8), InterfaceSlot>,
    device: &UsbDevice,
    id: u8,
    alternate_setting: u8,
) -> Result<&'a mut InterfaceSlot> {
    use std::collections::hash_map::Entry;

    match interfaces.entry((id, alternate_setting)) {
        Entry::Occupied(slot) => Ok(slot.into_mut()),
        Entry::Vacant(vacant) => {
            let interface = device
                .find_interface(id, alternate_setting)
                .cloned()
                .ok_or(common::HostError::NotSupported)?;
            Ok(vacant.insert(InterfaceSlot {
                interface,
                claimed: false,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockHost;
    use common::test_utils::{create_mock_camera, create_mock_device};
    use std::sync::atomic::AtomicUsize;

    struct CountingOwner {
        closed: AtomicUsize,
    }

    impl BlockOwner for CountingOwner {
        fn block_closed(&self, _block: &ControlBlock) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn open(host: &MockHost, device: &UsbDevice) -> Arc<ControlBlock> {
        let key = DeviceKey::new(device, None, KeyOptions::default());
        ControlBlock::open(host, device, key, None).unwrap()
    }

    #[test]
    fn test_open_parses_device_path() {
        let host = MockHost::new();
        let device = create_mock_device(7, 0x1234, 0x5678);
        host.attach_silently(device.clone());
        host.grant(&device);

        let block = open(&host, &device);

        assert_eq!(block.bus_number().unwrap(), 1);
        assert_eq!(block.device_number().unwrap(), 7);
        assert_eq!(block.info().unwrap().usb_version.as_deref(), Some("2.00"));
        assert_eq!(host.open_count(&device), 1);
    }

    #[test]
    fn test_unparsable_path_defaults_to_zero() {
        let host = MockHost::new();
        let mut device = create_mock_device(1, 0x1234, 0x5678);
        device.name = "usb-virtual".to_string();
        host.attach_silently(device.clone());
        host.grant(&device);

        let block = open(&host, &device);

        assert_eq!(block.bus_number().unwrap(), 0);
        assert_eq!(block.device_number().unwrap(), 0);
    }

    #[test]
    fn test_interface_is_cached() {
        let host = MockHost::new();
        let camera = create_mock_camera(2, 0x2bdf, 0x0101);
        host.attach_silently(camera.clone());
        host.grant(&camera);
        let block = open(&host, &camera);

        let first = block.interface(1, 1).unwrap();
        let second = block.interface(1, 1).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.endpoint_count, 1);
        assert!(block.interface(4, 0).is_err());
    }

    #[test]
    fn test_close_releases_claimed_interfaces_once() {
        let host = MockHost::new();
        let camera = create_mock_camera(2, 0x2bdf, 0x0101);
        host.attach_silently(camera.clone());
        host.grant(&camera);
        let block = open(&host, &camera);

        block.claim_interface(0, 0, true).unwrap();
        block.claim_interface(1, 1, false).unwrap();
        block.claim_interface(1, 1, false).unwrap();
        block.interface(1, 0).unwrap();
        assert_eq!(block.claimed_count().unwrap(), 2);

        block.close().unwrap();
        block.close().unwrap();

        assert_eq!(host.released_count(&camera), 2);
        assert_eq!(host.close_count(&camera), 1);
    }

    #[test]
    fn test_accessors_fail_after_close() {
        let host = MockHost::new();
        let camera = create_mock_camera(3, 0x2bdf, 0x0101);
        host.attach_silently(camera.clone());
        host.grant(&camera);
        let block = open(&host, &camera);

        block.close().unwrap();

        assert!(block.is_closed());
        assert!(matches!(block.file_descriptor(), Err(Error::Closed)));
        assert!(matches!(block.device(), Err(Error::Closed)));
        assert!(matches!(block.bus_number(), Err(Error::Closed)));
        assert!(matches!(block.serial(), Err(Error::Closed)));
        assert!(matches!(block.interface(0, 0), Err(Error::Closed)));
        assert!(matches!(block.claim_interface(0, 0, false), Err(Error::Closed)));
        assert!(matches!(block.raw_descriptors(), Err(Error::Closed)));
    }

    #[test]
    fn test_owner_notified_once() {
        let host = MockHost::new();
        let device = create_mock_device(1, 0x1234, 0x5678);
        host.attach_silently(device.clone());
        host.grant(&device);

        let owner = Arc::new(CountingOwner {
            closed: AtomicUsize::new(0),
        });
        let weak: Weak<dyn BlockOwner> = Arc::downgrade(&owner) as Weak<dyn BlockOwner>;
        let key = DeviceKey::new(&device, None, KeyOptions::default());
        let block = ControlBlock::open(&host, &device, key, Some(weak)).unwrap();

        block.close().unwrap();
        block.close().unwrap();

        assert_eq!(owner.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_native_close_still_closes() {
        let host = MockHost::new();
        let device = create_mock_device(1, 0x1234, 0x5678);
        host.attach_silently(device.clone());
        host.grant(&device);
        host.fail_close_for(&device);
        let block = open(&host, &device);

        assert!(block.close().is_err());
        assert!(block.is_closed());
        assert!(block.close().is_ok());
        assert_eq!(host.close_count(&device), 1);
    }

    #[test]
    fn test_key_with_serial_uses_connection_serial() {
        let host = MockHost::new();
        let camera = create_mock_camera(4, 0x2bdf, 0x0101);
        host.attach_silently(camera.clone());
        host.grant(&camera);
        let block = open(&host, &camera);

        let key = block.key_with_serial(KeyOptions::default()).unwrap();

        assert_eq!(key.as_str(), "11231#257#239#2#1#SN000004####");
    }
}
