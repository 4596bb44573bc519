//! Device monitor facade
//!
//! The only type an application talks to. It enumerates devices against a
//! filter list, drives permission requests, pools open control blocks per
//! device identity, and reports lifecycle changes to a [`DeviceListener`].
//!
//! ```text
//! event source ──┐
//! reconcile tick ┼──> worker (serialized) ──> broker / pool ──> listener
//! Monitor API ───┘
//! ```
//!
//! Blocking request/response calls made from the worker thread itself (from
//! inside a listener callback) run inline instead of waiting on the queue.

use crate::usb::control_block::ControlBlock;
use crate::usb::filter::{DeviceFilter, select};
use crate::usb::host::{EventWatch, UsbHost};
use crate::usb::identity::{DeviceKey, KeyOptions};
use crate::usb::listener::DeviceListener;
use crate::usb::permission::{BrokerStep, PermissionRequest};
use crate::usb::reconcile::{DEFAULT_CHECK_INTERVAL, DEFAULT_FIRST_CHECK_DELAY, ReconciliationLoop};
use crate::usb::worker::{CoreParts, MonitorCore, Task, spawn_worker};
use async_channel::Sender;
use common::{DeviceInfo, Error, EventSender, Result, UsbDevice, create_event_channel};
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLockWriteGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default capacity of the worker task queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
/// Default time `destroy` waits for the worker to finish
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle state of one device identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceState {
    Unknown,
    PendingPermission,
    Connected,
    /// Closed or detached; terminal until the device is seen again
    Disconnected,
}

/// Construction parameters
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub filters: Vec<DeviceFilter>,
    pub key_options: KeyOptions,
    pub first_check_delay: Duration,
    pub check_interval: Duration,
    pub queue_capacity: usize,
    pub shutdown_timeout: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            key_options: KeyOptions::default(),
            first_check_delay: DEFAULT_FIRST_CHECK_DELAY,
            check_interval: DEFAULT_CHECK_INTERVAL,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// USB device monitor
pub struct Monitor {
    core: Arc<MonitorCore>,
    watch: Mutex<Option<Box<dyn EventWatch>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Monitor {
    /// Create a monitor and start its worker
    ///
    /// The monitor starts unregistered: no events are handled and no
    /// reconciliation runs until [`Monitor::register`].
    pub fn new(
        host: Arc<dyn UsbHost>,
        listener: Arc<dyn DeviceListener>,
        settings: MonitorSettings,
    ) -> Result<Self> {
        if settings.queue_capacity == 0 {
            return Err(Error::Config("queue capacity must be greater than 0".to_string()));
        }

        let (task_tx, task_rx) = async_channel::bounded(settings.queue_capacity);
        let (event_tx, event_rx) = create_event_channel();

        let core = MonitorCore::new(CoreParts {
            host,
            listener,
            filters: settings.filters,
            key_options: settings.key_options,
            reconcile: ReconciliationLoop::new(settings.first_check_delay, settings.check_interval),
            tasks: task_tx,
            events: event_tx,
        });

        let worker = spawn_worker(Arc::clone(&core), task_rx, event_rx)?;

        Ok(Self {
            core,
            watch: Mutex::new(None),
            worker: Mutex::new(Some(worker)),
            shutdown_timeout: settings.shutdown_timeout,
        })
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.core.is_destroyed() {
            return Err(Error::InvalidState("monitor destroyed"));
        }
        Ok(())
    }

    /// Send a request to the worker and wait for the reply
    fn call<R>(&self, make: impl FnOnce(Sender<R>) -> Task) -> Result<R> {
        let (tx, rx) = async_channel::bounded(1);
        self.core.enqueue(make(tx))?;
        rx.recv_blocking()
            .map_err(|_| Error::Channel("monitor worker stopped".to_string()))
    }

    /// Start handling host events and reconciliation
    ///
    /// Idempotent while registered. Fails once destroyed.
    pub fn register(&self) -> Result<()> {
        self.ensure_alive()?;
        if self.core.registered.swap(true, Ordering::AcqRel) {
            debug!("Monitor already registered");
            return Ok(());
        }

        match self.core.host.watch(self.core.events.clone()) {
            Ok(watch) => *lock(&self.watch) = Some(watch),
            Err(e) => warn!("Host events unavailable ({}), relying on reconciliation", e),
        }

        self.core.enqueue(Task::StartReconcile)?;
        info!("Monitor registered");
        Ok(())
    }

    /// Stop handling host events and reconciliation
    ///
    /// Open control blocks stay open; tasks already queued still run.
    pub fn unregister(&self) -> Result<()> {
        self.ensure_alive()?;
        if !self.core.registered.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        lock(&self.watch).take();
        self.core.enqueue(Task::StopReconcile)?;
        info!("Monitor unregistered");
        Ok(())
    }

    pub fn is_registered(&self) -> bool {
        self.core.is_registered()
    }

    pub fn is_destroyed(&self) -> bool {
        self.core.is_destroyed()
    }

    /// Close every open control block and stop the worker
    ///
    /// Irreversible. A second call does nothing. Close failures are logged
    /// per device and do not stop the rest of the teardown.
    pub fn destroy(&self) -> Result<()> {
        if self.core.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Destroying monitor");

        self.core.registered.store(false, Ordering::Release);
        lock(&self.watch).take();

        if let Err(e) = self.core.enqueue(Task::Destroy) {
            warn!("Worker unavailable ({}), closing devices inline", e);
            self.core.teardown();
        }

        if self.core.on_worker_thread() {
            return Ok(());
        }

        let Some(worker) = lock(&self.worker).take() else {
            return Ok(());
        };

        let deadline = Instant::now() + self.shutdown_timeout;
        while !worker.is_finished() {
            if Instant::now() >= deadline {
                warn!("Worker did not stop within {:?}", self.shutdown_timeout);
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        if worker.join().is_err() {
            warn!("Monitor worker panicked during shutdown");
        }
        Ok(())
    }

    /// Request permission for `device`
    ///
    /// When permission is already held the device is connected without a
    /// prompt. Otherwise a prompt is issued and the answer is handled when
    /// it arrives. Refusal, an unissuable prompt, and calling while
    /// unregistered all end in `on_cancel`.
    pub fn request_permission(&self, device: &UsbDevice) -> Result<PermissionRequest> {
        self.ensure_alive()?;

        let mut queued = Ok(());
        let result = self
            .core
            .broker
            .request(device, self.core.is_registered(), |step| {
                if queued.is_err() {
                    return;
                }
                let task = match step {
                    BrokerStep::Connect => Task::Connect(device.clone()),
                    BrokerStep::AwaitResponse => Task::AwaitPermission(device.clone()),
                    BrokerStep::Cancel => Task::Cancel(device.clone()),
                };
                queued = self.core.enqueue(task);
            });

        queued?;
        Ok(result)
    }

    /// Live permission check
    pub fn has_permission(&self, device: &UsbDevice) -> Result<bool> {
        self.ensure_alive()?;
        Ok(self.core.broker.is_granted(device))
    }

    /// Devices granted as of the last check
    pub fn permission_count(&self) -> usize {
        self.core.permissions.len()
    }

    /// Open `device`, or return its pooled control block
    ///
    /// No listener callback fires. Fails with `PermissionDenied` without a
    /// grant.
    pub fn open_device(&self, device: &UsbDevice) -> Result<Arc<ControlBlock>> {
        self.ensure_alive()?;
        if self.core.on_worker_thread() {
            return self.core.open_pooled(device);
        }
        self.call(|reply| Task::Open {
            device: device.clone(),
            reply,
        })?
    }

    /// Open a second handle to `device` that is never pooled
    ///
    /// The caller owns the returned block and must close it.
    pub fn open_independent(&self, device: &UsbDevice) -> Result<Arc<ControlBlock>> {
        self.ensure_alive()?;
        if self.core.on_worker_thread() {
            return self.core.open_independent(device);
        }
        self.call(|reply| Task::OpenIndependent {
            device: device.clone(),
            reply,
        })?
    }

    /// Manufacturer, product, serial and version strings of `device`
    pub fn device_info(&self, device: &UsbDevice) -> Result<DeviceInfo> {
        self.ensure_alive()?;
        if self.core.on_worker_thread() {
            return Ok(self.core.device_info(device));
        }
        self.call(|reply| Task::Info {
            device: device.clone(),
            reply,
        })
    }

    fn filters_mut(&self) -> Result<RwLockWriteGuard<'_, Vec<DeviceFilter>>> {
        self.ensure_alive()?;
        Ok(self
            .core
            .filters
            .write()
            .unwrap_or_else(PoisonError::into_inner))
    }

    pub fn set_filters(&self, filters: Vec<DeviceFilter>) -> Result<()> {
        *self.filters_mut()? = filters;
        Ok(())
    }

    pub fn add_filter(&self, filter: DeviceFilter) -> Result<()> {
        self.filters_mut()?.push(filter);
        Ok(())
    }

    /// Remove the first filter equal to `filter`
    pub fn remove_filter(&self, filter: &DeviceFilter) -> Result<bool> {
        let mut filters = self.filters_mut()?;
        match filters.iter().position(|f| f == filter) {
            Some(index) => {
                filters.remove(index);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn filters(&self) -> Vec<DeviceFilter> {
        self.core.filters()
    }

    /// Attached devices selected by the active filters
    pub fn device_list(&self) -> Result<Vec<UsbDevice>> {
        self.ensure_alive()?;
        self.core.device_list()
    }

    /// Attached devices selected by `filters` instead of the active ones
    pub fn device_list_with(&self, filters: &[DeviceFilter]) -> Result<Vec<UsbDevice>> {
        self.ensure_alive()?;
        Ok(select(filters, self.core.host.devices()?))
    }

    /// Every attached device, unfiltered
    pub fn devices(&self) -> Result<Vec<UsbDevice>> {
        self.ensure_alive()?;
        Ok(self.core.host.devices()?)
    }

    pub fn device_count(&self) -> Result<usize> {
        Ok(self.device_list()?.len())
    }

    /// Log every attached device with its key and state
    pub fn dump_devices(&self) -> Result<()> {
        let devices = self.devices()?;
        info!("{} USB device(s) attached", devices.len());
        for device in &devices {
            let key = self.device_key(device);
            info!(
                "  {} {:04x}:{:04x} class={:#04x} state={:?} permission={} key={}",
                device.name,
                device.vendor_id,
                device.product_id,
                device.class,
                self.core.state_of(&key),
                self.core.permissions.contains(&key),
                key
            );
        }
        Ok(())
    }

    /// Identity key of `device` under the configured key options
    pub fn device_key(&self, device: &UsbDevice) -> DeviceKey {
        self.core.key_of(device)
    }

    pub fn device_state(&self, device: &UsbDevice) -> DeviceState {
        self.core.state_of(&self.core.key_of(device))
    }

    /// Pooled control block of `device`, if open
    pub fn control_block(&self, device: &UsbDevice) -> Option<Arc<ControlBlock>> {
        self.core.pool.get(&self.core.key_of(device))
    }

    /// Number of pooled control blocks
    pub fn connection_count(&self) -> usize {
        self.core.pool.len()
    }

    /// Run a reconciliation pass now and wait for it
    pub fn reconcile_now(&self) -> Result<()> {
        self.ensure_alive()?;
        if self.core.on_worker_thread() {
            self.core.reconcile_pass();
            return Ok(());
        }
        self.call(Task::Reconcile)
    }

    /// Wait until the worker has handled everything queued before this call,
    /// including host events already delivered
    pub fn flush(&self) -> Result<()> {
        self.ensure_alive()?;
        if self.core.on_worker_thread() {
            return Ok(());
        }
        self.call(Task::Barrier)
    }

    /// Sender for delivering host events by hand
    pub fn event_sender(&self) -> EventSender {
        self.core.events.clone()
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            warn!("Error destroying monitor on drop: {}", e);
        }
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("registered", &self.is_registered())
            .field("destroyed", &self.is_destroyed())
            .field("connections", &self.connection_count())
            .field("permissions", &self.permission_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockHost;
    use crate::usb::listener::ChannelListener;
    use common::test_utils::create_mock_device;

    fn monitor(host: &Arc<MockHost>) -> Monitor {
        let (listener, _rx) = ChannelListener::new();
        Monitor::new(host.clone(), Arc::new(listener), MonitorSettings::default()).unwrap()
    }

    #[test]
    fn test_register_is_idempotent() {
        let host = Arc::new(MockHost::new());
        let monitor = monitor(&host);

        monitor.register().unwrap();
        monitor.register().unwrap();

        assert!(monitor.is_registered());
        assert!(host.is_watched());
    }

    #[test]
    fn test_unregister_stops_watch() {
        let host = Arc::new(MockHost::new());
        let monitor = monitor(&host);
        monitor.register().unwrap();

        monitor.unregister().unwrap();

        assert!(!monitor.is_registered());
        assert!(!host.is_watched());
    }

    #[test]
    fn test_destroy_is_terminal() {
        let host = Arc::new(MockHost::new());
        let monitor = monitor(&host);

        monitor.destroy().unwrap();
        monitor.destroy().unwrap();

        assert!(matches!(monitor.register(), Err(Error::InvalidState(_))));
        assert!(matches!(monitor.unregister(), Err(Error::InvalidState(_))));
        assert!(matches!(monitor.flush(), Err(Error::InvalidState(_))));
        let device = create_mock_device(1, 0x1234, 0x5678);
        assert!(matches!(
            monitor.request_permission(&device),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_zero_queue_capacity_rejected() {
        let host = Arc::new(MockHost::new());
        let (listener, _rx) = ChannelListener::new();
        let settings = MonitorSettings {
            queue_capacity: 0,
            ..MonitorSettings::default()
        };

        assert!(matches!(
            Monitor::new(host, Arc::new(listener), settings),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_filters_apply_to_device_list() {
        let host = Arc::new(MockHost::new());
        host.attach_silently(create_mock_device(1, 0x1234, 0x0001));
        host.attach_silently(create_mock_device(2, 0xabcd, 0x0002));
        let monitor = monitor(&host);

        assert_eq!(monitor.device_count().unwrap(), 2);

        let filter = DeviceFilter::vendor_product(0x1234, None);
        monitor.add_filter(filter.clone()).unwrap();
        assert_eq!(monitor.device_count().unwrap(), 1);
        assert_eq!(monitor.devices().unwrap().len(), 2);
        assert_eq!(
            monitor
                .device_list_with(&[DeviceFilter::vendor_product(0xabcd, None)])
                .unwrap()[0]
                .vendor_id,
            0xabcd
        );

        assert!(monitor.remove_filter(&filter).unwrap());
        assert!(!monitor.remove_filter(&filter).unwrap());
        assert_eq!(monitor.device_count().unwrap(), 2);
    }

    #[test]
    fn test_device_info_without_permission_uses_fallbacks() {
        let host = Arc::new(MockHost::new());
        let device = create_mock_device(1, 0x1234, 0x5678);
        host.attach_silently(device.clone());
        let monitor = monitor(&host);

        let info = monitor.device_info(&device).unwrap();

        assert_eq!(info.manufacturer.as_deref(), Some("1234"));
        assert_eq!(info.product.as_deref(), Some("5678"));
        assert_eq!(host.open_count(&device), 0);
    }
}
