//! Monitor worker thread
//!
//! Every lifecycle transition (attach, connect, cancel, disconnect, detach,
//! reconciliation) runs on one dedicated thread, one at a time. That single
//! writer is what keeps a device down to one native open and every block
//! closed exactly once, without per-device locks.
//!
//! The thread runs a current-thread Tokio runtime and selects over three
//! sources, in priority order: the bounded task queue fed by the
//! [`Monitor`](crate::usb::Monitor) API, the unbounded host event channel,
//! and the reconciliation timer.

use crate::usb::control_block::{BlockOwner, ControlBlock};
use crate::usb::descriptor::read_device_info;
use crate::usb::filter::{DeviceFilter, select};
use crate::usb::host::UsbHost;
use crate::usb::identity::{DeviceKey, KeyOptions};
use crate::usb::listener::DeviceListener;
use crate::usb::monitor::DeviceState;
use crate::usb::permission::{BrokerStep, PermissionBroker, PermissionCache};
use crate::usb::pool::ConnectionPool;
use crate::usb::reconcile::{ReconciliationLoop, sleep_until};
use async_channel::{Receiver, Sender, TrySendError};
use common::{DeviceInfo, Error, EventReceiver, EventSender, HostEvent, Result, UsbDevice};
use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, Weak};
use std::thread::{JoinHandle, ThreadId};
use tracing::{debug, error, info, warn};

/// Work queued for the monitor worker
pub(crate) enum Task {
    /// Permission confirmed; open or reuse and report `on_connect`
    Connect(UsbDevice),
    /// A prompt is about to be issued for this device
    AwaitPermission(UsbDevice),
    /// Permission refused or unavailable; report `on_cancel`
    Cancel(UsbDevice),
    /// A pooled block was closed off the worker; unpool it and report
    /// `on_disconnect`
    Disconnected(Arc<ControlBlock>),
    StartReconcile,
    StopReconcile,
    /// Run one reconciliation pass now
    Reconcile(Sender<()>),
    Open {
        device: UsbDevice,
        reply: Sender<Result<Arc<ControlBlock>>>,
    },
    OpenIndependent {
        device: UsbDevice,
        reply: Sender<Result<Arc<ControlBlock>>>,
    },
    Info {
        device: UsbDevice,
        reply: Sender<DeviceInfo>,
    },
    /// Acknowledged once everything queued before it has been handled
    Barrier(Sender<()>),
    /// Close every pooled block and stop the worker
    Destroy,
}

impl Task {
    fn name(&self) -> &'static str {
        match self {
            Task::Connect(_) => "connect",
            Task::AwaitPermission(_) => "await-permission",
            Task::Cancel(_) => "cancel",
            Task::Disconnected(_) => "disconnected",
            Task::StartReconcile => "start-reconcile",
            Task::StopReconcile => "stop-reconcile",
            Task::Reconcile(_) => "reconcile",
            Task::Open { .. } => "open",
            Task::OpenIndependent { .. } => "open-independent",
            Task::Info { .. } => "info",
            Task::Barrier(_) => "barrier",
            Task::Destroy => "destroy",
        }
    }
}

/// State shared between the monitor facade and its worker
///
/// The pool, the permission cache and the state map are read from any
/// thread; they are only written from the worker (or inline when the
/// facade is called from a listener callback on the worker).
pub(crate) struct MonitorCore {
    pub(crate) host: Arc<dyn UsbHost>,
    pub(crate) listener: Arc<dyn DeviceListener>,
    pub(crate) broker: PermissionBroker,
    pub(crate) pool: ConnectionPool,
    pub(crate) permissions: PermissionCache,
    pub(crate) filters: RwLock<Vec<DeviceFilter>>,
    pub(crate) key_options: KeyOptions,
    pub(crate) states: RwLock<HashMap<DeviceKey, DeviceState>>,
    pub(crate) registered: AtomicBool,
    pub(crate) destroyed: AtomicBool,
    pub(crate) events: EventSender,
    reconcile: Mutex<ReconciliationLoop>,
    tasks: Sender<Task>,
    /// Tasks the worker queued for itself while the queue was full
    overflow: Mutex<VecDeque<Task>>,
    worker_thread: OnceLock<ThreadId>,
    this: Weak<MonitorCore>,
}

pub(crate) struct CoreParts {
    pub host: Arc<dyn UsbHost>,
    pub listener: Arc<dyn DeviceListener>,
    pub filters: Vec<DeviceFilter>,
    pub key_options: KeyOptions,
    pub reconcile: ReconciliationLoop,
    pub tasks: Sender<Task>,
    pub events: EventSender,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MonitorCore {
    pub(crate) fn new(parts: CoreParts) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            broker: PermissionBroker::new(Arc::clone(&parts.host)),
            host: parts.host,
            listener: parts.listener,
            pool: ConnectionPool::new(),
            permissions: PermissionCache::new(),
            filters: RwLock::new(parts.filters),
            key_options: parts.key_options,
            states: RwLock::new(HashMap::new()),
            registered: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            events: parts.events,
            reconcile: Mutex::new(parts.reconcile),
            tasks: parts.tasks,
            overflow: Mutex::new(VecDeque::new()),
            worker_thread: OnceLock::new(),
            this: this.clone(),
        })
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub(crate) fn on_worker_thread(&self) -> bool {
        self.worker_thread.get() == Some(&std::thread::current().id())
    }

    pub(crate) fn key_of(&self, device: &UsbDevice) -> DeviceKey {
        DeviceKey::new(device, None, self.key_options)
    }

    pub(crate) fn filters(&self) -> Vec<DeviceFilter> {
        self.filters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn state_of(&self, key: &DeviceKey) -> DeviceState {
        if self.pool.contains(key) {
            return DeviceState::Connected;
        }
        self.states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
            .unwrap_or(DeviceState::Unknown)
    }

    fn set_state(&self, key: DeviceKey, state: DeviceState) {
        self.states
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, state);
    }

    fn owner(&self) -> Weak<dyn BlockOwner> {
        self.this.clone()
    }

    /// Queue a task for the worker
    ///
    /// Callers off the worker wait for room in the queue. The worker itself
    /// never blocks on its own queue; when it is full the task goes to an
    /// overflow list handled right after the current item.
    pub(crate) fn enqueue(&self, task: Task) -> Result<()> {
        if self.on_worker_thread() {
            return match self.tasks.try_send(task) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(task)) => {
                    lock(&self.overflow).push_back(task);
                    Ok(())
                }
                Err(TrySendError::Closed(_)) => Err(Error::Channel("monitor worker stopped".to_string())),
            };
        }

        self.tasks
            .send_blocking(task)
            .map_err(|_| Error::Channel("monitor worker stopped".to_string()))
    }

    fn take_overflow(&self) -> Option<Task> {
        lock(&self.overflow).pop_front()
    }

    fn drain_overflow(&self) -> Vec<Task> {
        lock(&self.overflow).drain(..).collect()
    }

    /// Filtered enumeration
    pub(crate) fn device_list(&self) -> Result<Vec<UsbDevice>> {
        let devices = self.host.devices()?;
        Ok(select(&self.filters(), devices))
    }

    /// Handle one task; returns false when the worker should stop
    pub(crate) fn handle_task(&self, task: Task) -> bool {
        match task {
            Task::Connect(device) => self.connect(device),
            Task::AwaitPermission(device) => {
                let key = self.key_of(&device);
                if self.state_of(&key) != DeviceState::Connected {
                    self.set_state(key, DeviceState::PendingPermission);
                }
            }
            Task::Cancel(device) => self.cancel(device),
            Task::Disconnected(block) => self.release_block(&block),
            Task::StartReconcile => lock(&self.reconcile).start(),
            Task::StopReconcile => lock(&self.reconcile).stop(),
            Task::Reconcile(reply) => {
                self.reconcile_pass();
                let _ = reply.try_send(());
            }
            Task::Open { device, reply } => {
                let _ = reply.try_send(self.open_pooled(&device));
            }
            Task::OpenIndependent { device, reply } => {
                let _ = reply.try_send(self.open_independent(&device));
            }
            Task::Info { device, reply } => {
                let _ = reply.try_send(self.device_info(&device));
            }
            Task::Barrier(reply) => {
                let _ = reply.try_send(());
            }
            Task::Destroy => {
                self.teardown();
                return false;
            }
        }
        true
    }

    pub(crate) fn handle_event(&self, event: HostEvent) {
        if self.is_destroyed() {
            debug!("Ignoring host event after destroy");
            return;
        }

        match event {
            HostEvent::Attached(device) => {
                if !self.is_registered() {
                    debug!("Ignoring attach of {} while unregistered", device.name);
                    return;
                }
                self.attached(device);
            }
            HostEvent::Detached(device) => {
                if !self.is_registered() {
                    debug!("Ignoring detach of {} while unregistered", device.name);
                    return;
                }
                self.detached(device);
            }
            HostEvent::PermissionResult { device, granted } => {
                if !self.is_registered() {
                    debug!("Permission answer for {} while unregistered", device.name);
                    self.cancel(device);
                    return;
                }
                match PermissionBroker::on_result(granted) {
                    BrokerStep::Connect => self.connect(device),
                    _ => self.cancel(device),
                }
            }
        }
    }

    fn attached(&self, device: UsbDevice) {
        if !crate::usb::filter::is_selected(&self.filters(), &device) {
            debug!("Attach of {} not selected by filters", device.name);
            return;
        }

        let key = self.key_of(&device);
        let granted = self.host.has_permission(&device);
        self.permissions.update(key.clone(), &device, granted);

        if self.state_of(&key) == DeviceState::Disconnected {
            self.set_state(key.clone(), DeviceState::Unknown);
        }

        if !self.pool.contains(&key) {
            info!("Device attached: {} ({})", device.name, key);
            self.listener.on_attach(&device);
        }
    }

    fn detached(&self, device: UsbDevice) {
        let key = self.key_of(&device);
        info!("Device detached: {} ({})", device.name, key);

        lock(&self.reconcile).reset_count();

        if let Some(block) = self.pool.get(&key)
            && let Err(e) = block.close()
        {
            warn!("Error closing {} on detach: {}", device.name, e);
        }

        self.set_state(key, DeviceState::Disconnected);
        self.listener.on_detach(&device);
    }

    fn connect(&self, device: UsbDevice) {
        if self.is_destroyed() {
            debug!("Not connecting {} after destroy", device.name);
            self.cancel(device);
            return;
        }

        let key = self.key_of(&device);
        self.permissions.insert(key.clone(), device.clone());

        match self.pool.open_or_reuse(self.host.as_ref(), &device, &key, self.owner()) {
            Ok(connection) => {
                info!(
                    "Connected {} ({}, new={})",
                    device.name,
                    key,
                    connection.is_new()
                );
                self.set_state(key, DeviceState::Connected);
                self.listener
                    .on_connect(&device, connection.block(), connection.is_new());
            }
            Err(e) => {
                warn!("Failed to open {}: {}", device.name, e);
                self.cancel(device);
            }
        }
    }

    fn cancel(&self, device: UsbDevice) {
        let key = self.key_of(&device);
        debug!("Cancelled {} ({})", device.name, key);
        self.permissions.remove(&key);
        self.set_state(key, DeviceState::Unknown);
        self.listener.on_cancel(&device);
    }

    /// Pooled open-or-reuse without listener callbacks
    pub(crate) fn open_pooled(&self, device: &UsbDevice) -> Result<Arc<ControlBlock>> {
        if self.is_destroyed() {
            return Err(Error::InvalidState("monitor destroyed"));
        }
        if !self.host.has_permission(device) {
            return Err(Error::PermissionDenied(device.name.clone()));
        }

        let key = self.key_of(device);
        self.permissions.insert(key.clone(), device.clone());
        let connection = self
            .pool
            .open_or_reuse(self.host.as_ref(), device, &key, self.owner())?;
        self.set_state(key, DeviceState::Connected);
        Ok(connection.into_block())
    }

    /// A second native handle that never enters the pool
    pub(crate) fn open_independent(&self, device: &UsbDevice) -> Result<Arc<ControlBlock>> {
        if self.is_destroyed() {
            return Err(Error::InvalidState("monitor destroyed"));
        }
        if !self.host.has_permission(device) {
            return Err(Error::PermissionDenied(device.name.clone()));
        }
        ControlBlock::open(self.host.as_ref(), device, self.key_of(device), None)
    }

    /// Strings of `device`, opening a short-lived handle when permitted
    pub(crate) fn device_info(&self, device: &UsbDevice) -> DeviceInfo {
        if let Some(block) = self.pool.get(&self.key_of(device))
            && let Ok(info) = block.info()
        {
            return info.clone();
        }

        if !self.host.has_permission(device) {
            return read_device_info(device, None);
        }

        match self.host.open(device) {
            Ok(mut connection) => {
                let info = read_device_info(device, Some(connection.as_ref()));
                if let Err(e) = connection.close() {
                    warn!("Failed to close info handle for {}: {}", device.name, e);
                }
                info
            }
            Err(e) => {
                debug!("Could not open {} for strings: {}", device.name, e);
                read_device_info(device, None)
            }
        }
    }

    /// One reconciliation pass: enumerate, rebuild the permission cache and
    /// re-announce every device when a count went up
    pub(crate) fn reconcile_pass(&self) {
        if !self.is_registered() || self.is_destroyed() {
            return;
        }

        let devices = match self.device_list() {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Reconcile enumeration failed: {}", e);
                return;
            }
        };

        let before = self.permissions.len();
        let granted = self
            .permissions
            .rebuild(self.host.as_ref(), &devices, |d| self.key_of(d));
        let announce = lock(&self.reconcile).observe(devices.len(), before, granted);

        if announce {
            for device in &devices {
                if !self.is_registered() {
                    break;
                }
                self.listener.on_attach(device);
            }
        }
    }

    fn reconcile_tick(&self) {
        self.reconcile_pass();
        lock(&self.reconcile).advance();
    }

    fn reconcile_deadline(&self) -> Option<tokio::time::Instant> {
        lock(&self.reconcile).deadline()
    }

    /// Close every pooled block, logging failures per device
    pub(crate) fn teardown(&self) {
        lock(&self.reconcile).stop();

        let blocks = self.pool.drain();
        info!("Closing {} open device(s)", blocks.len());

        let mut failures = 0;
        for (key, block) in blocks {
            if let Err(e) = block.close() {
                failures += 1;
                warn!("Failed to close {} during teardown: {}", key, e);
            }
        }

        self.permissions.clear();
        if failures > 0 {
            warn!("Teardown finished with {} close failure(s)", failures);
        }
    }

    /// Drop a closed block from the pool and report `on_disconnect`
    fn release_block(&self, block: &ControlBlock) {
        let (key, device) = block.identity();
        self.pool.remove_if_same(key, block);
        self.listener.on_disconnect(device, block);
        if !self.pool.contains(key) {
            self.set_state(key.clone(), DeviceState::Disconnected);
        }
    }
}

impl BlockOwner for MonitorCore {
    /// Closes made off the worker are handed to it, so the pool and the
    /// state map are only written there
    fn block_closed(&self, block: &ControlBlock) {
        if self.on_worker_thread() {
            self.release_block(block);
            return;
        }

        match block.handle() {
            Some(handle) => {
                if let Err(e) = self.enqueue(Task::Disconnected(handle)) {
                    debug!("Worker gone, reporting disconnect inline: {}", e);
                    self.release_block(block);
                }
            }
            None => self.release_block(block),
        }
    }
}

/// Owns the receiving ends and drives the core
struct EventWorker {
    core: Arc<MonitorCore>,
    tasks: Receiver<Task>,
    events: EventReceiver,
}

impl EventWorker {
    async fn run(self) {
        info!("Monitor worker started");

        'worker: loop {
            let deadline = self.core.reconcile_deadline();
            let keep_running = tokio::select! {
                biased;

                task = self.tasks.recv() => match task {
                    Ok(Task::Barrier(reply)) => {
                        self.drain_events();
                        let _ = reply.try_send(());
                        true
                    }
                    Ok(task) => self.guarded(task.name(), |core| core.handle_task(task)),
                    Err(_) => {
                        debug!("Task queue closed");
                        self.guarded("destroy", |core| core.handle_task(Task::Destroy))
                    }
                },

                event = self.events.recv() => match event {
                    Ok(event) => self.guarded("event", |core| {
                        core.handle_event(event);
                        true
                    }),
                    Err(_) => {
                        debug!("Event channel closed");
                        self.guarded("destroy", |core| core.handle_task(Task::Destroy))
                    }
                },

                _ = sleep_until(deadline) => self.guarded("reconcile", |core| {
                    core.reconcile_tick();
                    true
                }),
            };

            if !keep_running {
                break;
            }

            while let Some(task) = self.core.take_overflow() {
                if !self.guarded(task.name(), |core| core.handle_task(task)) {
                    break 'worker;
                }
            }
        }

        self.shutdown();
        info!("Monitor worker stopped");
    }

    /// Refuse new tasks and drop the ones still queued
    ///
    /// Dropping a task drops its reply sender, so a caller waiting on it
    /// gets an error instead of blocking. Disconnects still queued are
    /// reported.
    fn shutdown(&self) {
        self.tasks.close();

        let mut pending = self.core.drain_overflow();
        while let Ok(task) = self.tasks.try_recv() {
            pending.push(task);
        }

        let mut dropped = 0;
        for task in pending {
            match task {
                task @ Task::Disconnected(_) => {
                    self.guarded(task.name(), |core| core.handle_task(task));
                }
                task => {
                    debug!("Dropping {} task on shutdown", task.name());
                    dropped += 1;
                }
            }
        }
        if dropped > 0 {
            warn!("Dropped {} queued task(s) on shutdown", dropped);
        }
    }

    /// Handle everything the event source delivered so far
    fn drain_events(&self) {
        while let Some(event) = self.events.try_recv() {
            self.guarded("event", |core| {
                core.handle_event(event);
                true
            });
        }
    }

    /// Run one item, catching panics from handlers and listener callbacks
    fn guarded(&self, what: &str, f: impl FnOnce(&MonitorCore) -> bool) -> bool {
        match catch_unwind(AssertUnwindSafe(|| f(self.core.as_ref()))) {
            Ok(keep_running) => keep_running,
            Err(e) => {
                error!("Panic in monitor worker while handling {}: {:?}", what, e);
                true
            }
        }
    }
}

/// Spawn the worker thread
pub(crate) fn spawn_worker(
    core: Arc<MonitorCore>,
    tasks: Receiver<Task>,
    events: EventReceiver,
) -> Result<JoinHandle<()>> {
    let handle = std::thread::Builder::new()
        .name("usb-monitor".to_string())
        .spawn(move || {
            let _ = core.worker_thread.set(std::thread::current().id());

            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    error!("Failed to build worker runtime: {}", e);
                    tasks.close();
                    while tasks.try_recv().is_ok() {}
                    core.teardown();
                    return;
                }
            };

            runtime.block_on(
                EventWorker {
                    core,
                    tasks,
                    events,
                }
                .run(),
            );
        })?;

    Ok(handle)
}
