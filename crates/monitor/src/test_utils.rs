//! In-memory host platform for tests
//!
//! [`MockHost`] keeps a list of attached devices and a set of granted ones,
//! answers permission prompts as scripted, and counts opens, closes and
//! interface releases per device. Events are only delivered while a watch
//! is active, like a real event source that has been stopped.
//!
//! # Example
//!
//! ```
//! use common::test_utils::create_mock_device;
//! use monitor::test_utils::{MockHost, PromptAnswer};
//!
//! let host = MockHost::new();
//! let device = create_mock_device(1, 0x1234, 0x5678);
//! host.attach_silently(device.clone());
//! host.set_prompt_answer(PromptAnswer::Grant);
//! assert_eq!(host.open_count(&device), 0);
//! ```

use crate::usb::host::{EventWatch, NativeConnection, UsbHost};
use common::test_utils::{
    create_mock_device_descriptor, create_mock_language_table, create_mock_string_descriptor,
};
use common::{EventSender, HostError, UsbDevice, UsbInterface};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// How the mock answers a permission prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PromptAnswer {
    /// Grant and deliver the answer at once
    Grant,
    /// Deny and deliver the answer at once
    Deny,
    /// Leave the prompt open until [`MockHost::respond`]
    #[default]
    Pending,
    /// Fail to issue the prompt
    Fail,
}

#[derive(Default)]
struct MockState {
    devices: Vec<UsbDevice>,
    granted: HashSet<String>,
    answer: PromptAnswer,
    prompts: usize,
    pending: Vec<UsbDevice>,
    opens: HashMap<String, usize>,
    closes: HashMap<String, usize>,
    releases: HashMap<String, usize>,
    fail_open: HashSet<String>,
    fail_close: HashSet<String>,
    close_delay: Option<Duration>,
    closes_started: HashMap<String, usize>,
    sender: Option<EventSender>,
    /// Bumped per watch so a stale watch cannot clear a newer one
    watch_id: u64,
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scriptable in-memory host platform
#[derive(Clone, Default)]
pub struct MockHost {
    state: Arc<Mutex<MockState>>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host with `devices` attached, none granted
    pub fn with_devices(devices: Vec<UsbDevice>) -> Self {
        let host = Self::new();
        lock(&host.state).devices = devices;
        host
    }

    fn send(&self, f: impl FnOnce(&EventSender) -> common::Result<()>) {
        let sender = lock(&self.state).sender.clone();
        if let Some(sender) = sender {
            let _ = f(&sender);
        }
    }

    /// Attach a device and report it to the event source
    pub fn attach(&self, device: UsbDevice) {
        self.attach_silently(device.clone());
        self.send(|s| s.attached(device));
    }

    /// Attach a device without any event, as when the platform drops the
    /// notification
    pub fn attach_silently(&self, device: UsbDevice) {
        let mut state = lock(&self.state);
        state.devices.retain(|d| d.name != device.name);
        state.devices.push(device);
    }

    /// Remove a device and report it to the event source
    pub fn detach(&self, device: &UsbDevice) {
        lock(&self.state).devices.retain(|d| d.name != device.name);
        let device = device.clone();
        self.send(|s| s.detached(device));
    }

    pub fn grant(&self, device: &UsbDevice) {
        lock(&self.state).granted.insert(device.name.clone());
    }

    pub fn revoke(&self, device: &UsbDevice) {
        lock(&self.state).granted.remove(&device.name);
    }

    pub fn set_prompt_answer(&self, answer: PromptAnswer) {
        lock(&self.state).answer = answer;
    }

    /// Answer an open prompt for `device`
    pub fn respond(&self, device: &UsbDevice, granted: bool) {
        {
            let mut state = lock(&self.state);
            state.pending.retain(|d| d.name != device.name);
            if granted {
                state.granted.insert(device.name.clone());
            }
        }
        let device = device.clone();
        self.send(|s| s.permission_result(device, granted));
    }

    /// Devices with a prompt still open
    pub fn pending_prompts(&self) -> Vec<UsbDevice> {
        lock(&self.state).pending.clone()
    }

    pub fn prompt_count(&self) -> usize {
        lock(&self.state).prompts
    }

    pub fn fail_open_for(&self, device: &UsbDevice) {
        lock(&self.state).fail_open.insert(device.name.clone());
    }

    /// Make the native close of `device` report an error
    pub fn fail_close_for(&self, device: &UsbDevice) {
        lock(&self.state).fail_close.insert(device.name.clone());
    }

    /// Make every native close sleep for `delay` before it completes
    pub fn set_close_delay(&self, delay: Duration) {
        lock(&self.state).close_delay = Some(delay);
    }

    /// Native closes entered for `device`, finished or not
    pub fn closes_started(&self, device: &UsbDevice) -> usize {
        lock(&self.state)
            .closes_started
            .get(&device.name)
            .copied()
            .unwrap_or(0)
    }

    pub fn open_count(&self, device: &UsbDevice) -> usize {
        lock(&self.state).opens.get(&device.name).copied().unwrap_or(0)
    }

    pub fn close_count(&self, device: &UsbDevice) -> usize {
        lock(&self.state).closes.get(&device.name).copied().unwrap_or(0)
    }

    pub fn released_count(&self, device: &UsbDevice) -> usize {
        lock(&self.state).releases.get(&device.name).copied().unwrap_or(0)
    }

    /// Native handles opened and not yet closed, across all devices
    pub fn open_handles(&self) -> usize {
        let state = lock(&self.state);
        let opened: usize = state.opens.values().sum();
        let closed: usize = state.closes.values().sum();
        opened - closed
    }

    pub fn is_watched(&self) -> bool {
        lock(&self.state).sender.is_some()
    }
}

impl UsbHost for MockHost {
    fn devices(&self) -> Result<Vec<UsbDevice>, HostError> {
        Ok(lock(&self.state).devices.clone())
    }

    fn has_permission(&self, device: &UsbDevice) -> bool {
        lock(&self.state).granted.contains(&device.name)
    }

    fn request_permission(&self, device: &UsbDevice) -> Result<(), HostError> {
        let answer = {
            let mut state = lock(&self.state);
            state.prompts += 1;
            match state.answer {
                PromptAnswer::Grant => {
                    state.granted.insert(device.name.clone());
                }
                PromptAnswer::Pending => state.pending.push(device.clone()),
                PromptAnswer::Deny | PromptAnswer::Fail => {}
            }
            state.answer
        };

        match answer {
            PromptAnswer::Grant | PromptAnswer::Deny => {
                let device = device.clone();
                self.send(|s| s.permission_result(device, answer == PromptAnswer::Grant));
                Ok(())
            }
            PromptAnswer::Pending => Ok(()),
            PromptAnswer::Fail => Err(HostError::Other("prompt unavailable".to_string())),
        }
    }

    fn open(&self, device: &UsbDevice) -> Result<Box<dyn NativeConnection>, HostError> {
        let mut state = lock(&self.state);
        let attached = state
            .devices
            .iter()
            .find(|d| d.name == device.name)
            .cloned()
            .ok_or(HostError::NoDevice)?;
        if !state.granted.contains(&device.name) {
            return Err(HostError::Access);
        }
        if state.fail_open.contains(&device.name) {
            return Err(HostError::Busy);
        }

        *state.opens.entry(device.name.clone()).or_default() += 1;
        Ok(Box::new(MockConnection {
            device: attached,
            state: Arc::clone(&self.state),
            claimed: HashSet::new(),
            closed: false,
        }))
    }

    fn watch(&self, events: EventSender) -> Result<Box<dyn EventWatch>, HostError> {
        let mut state = lock(&self.state);
        state.watch_id += 1;
        state.sender = Some(events);
        Ok(Box::new(MockWatch {
            state: Arc::clone(&self.state),
            id: state.watch_id,
        }))
    }
}

struct MockWatch {
    state: Arc<Mutex<MockState>>,
    id: u64,
}

impl EventWatch for MockWatch {}

impl Drop for MockWatch {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        if state.watch_id == self.id {
            state.sender = None;
        }
    }
}

/// Native connection serving descriptors built from the device snapshot
///
/// String indices 1, 2 and 3 are the manufacturer, product and serial of
/// the snapshot; a missing string stalls.
pub struct MockConnection {
    device: UsbDevice,
    state: Arc<Mutex<MockState>>,
    claimed: HashSet<(u8, u8)>,
    closed: bool,
}

impl MockConnection {
    fn ensure_open(&self) -> Result<(), HostError> {
        if self.closed {
            return Err(HostError::NoDevice);
        }
        Ok(())
    }
}

impl NativeConnection for MockConnection {
    fn file_descriptor(&self) -> Option<i32> {
        let (_, device_number) = common::parse_bus_device(&self.device.name);
        Some(100 + device_number as i32)
    }

    fn raw_descriptors(&self) -> Result<Vec<u8>, HostError> {
        self.ensure_open()?;
        Ok(create_mock_device_descriptor(
            self.device.vendor_id,
            self.device.product_id,
        ))
    }

    fn serial(&self) -> Option<String> {
        self.device.serial_number.clone()
    }

    fn claim_interface(&mut self, interface: &UsbInterface, _force: bool) -> Result<(), HostError> {
        self.ensure_open()?;
        self.claimed.insert((interface.id, interface.alternate_setting));
        Ok(())
    }

    fn release_interface(&mut self, interface: &UsbInterface) -> Result<(), HostError> {
        self.ensure_open()?;
        if self
            .claimed
            .remove(&(interface.id, interface.alternate_setting))
        {
            *lock(&self.state)
                .releases
                .entry(self.device.name.clone())
                .or_default() += 1;
        }
        Ok(())
    }

    fn control_in(
        &self,
        _request_type: u8,
        _request: u8,
        value: u16,
        _index: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, HostError> {
        self.ensure_open()?;
        let reply = match value & 0xff {
            0 => create_mock_language_table(&[0x0409]),
            1 => string_reply(&self.device.manufacturer_name)?,
            2 => string_reply(&self.device.product_name)?,
            3 => string_reply(&self.device.serial_number)?,
            _ => return Err(HostError::Other("stall".to_string())),
        };
        let len = reply.len().min(buf.len());
        buf[..len].copy_from_slice(&reply[..len]);
        Ok(len)
    }

    fn close(&mut self) -> Result<(), HostError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let delay = {
            let mut state = lock(&self.state);
            *state
                .closes_started
                .entry(self.device.name.clone())
                .or_default() += 1;
            state.close_delay
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let mut state = lock(&self.state);
        *state.closes.entry(self.device.name.clone()).or_default() += 1;
        if state.fail_close.contains(&self.device.name) {
            return Err(HostError::Other("close failed".to_string()));
        }
        Ok(())
    }
}

fn string_reply(value: &Option<String>) -> Result<Vec<u8>, HostError> {
    value
        .as_deref()
        .map(create_mock_string_descriptor)
        .ok_or_else(|| HostError::Other("stall".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::create_event_channel;
    use common::test_utils::create_mock_device;

    #[test]
    fn test_open_requires_grant() {
        let host = MockHost::new();
        let device = create_mock_device(1, 0x1234, 0x5678);
        host.attach_silently(device.clone());

        assert!(matches!(host.open(&device), Err(HostError::Access)));

        host.grant(&device);
        assert!(host.open(&device).is_ok());
        assert_eq!(host.open_count(&device), 1);
    }

    #[test]
    fn test_open_missing_device() {
        let host = MockHost::new();
        let device = create_mock_device(1, 0x1234, 0x5678);
        host.grant(&device);

        assert!(matches!(host.open(&device), Err(HostError::NoDevice)));
    }

    #[test]
    fn test_events_only_while_watched() {
        let host = MockHost::new();
        let (tx, rx) = create_event_channel();

        host.attach(create_mock_device(1, 1, 1));
        assert!(rx.is_empty());

        let watch = host.watch(tx).unwrap();
        host.attach(create_mock_device(2, 2, 2));
        assert_eq!(rx.len(), 1);

        drop(watch);
        host.attach(create_mock_device(3, 3, 3));
        assert_eq!(rx.len(), 1);
        assert!(!host.is_watched());
    }

    #[test]
    fn test_prompt_answers() {
        let host = MockHost::new();
        let (tx, rx) = create_event_channel();
        let _watch = host.watch(tx).unwrap();
        let device = create_mock_device(1, 0x1234, 0x5678);

        host.set_prompt_answer(PromptAnswer::Fail);
        assert!(host.request_permission(&device).is_err());

        host.set_prompt_answer(PromptAnswer::Pending);
        host.request_permission(&device).unwrap();
        assert_eq!(host.pending_prompts().len(), 1);
        assert!(rx.is_empty());

        host.respond(&device, true);
        assert!(host.has_permission(&device));
        assert!(host.pending_prompts().is_empty());
        assert_eq!(host.prompt_count(), 2);
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn test_close_counts_once() {
        let host = MockHost::new();
        let device = create_mock_device(1, 0x1234, 0x5678);
        host.attach_silently(device.clone());
        host.grant(&device);
        host.fail_close_for(&device);

        let mut connection = host.open(&device).unwrap();
        assert!(connection.close().is_err());
        assert!(connection.close().is_ok());

        assert_eq!(host.close_count(&device), 1);
        assert_eq!(host.open_handles(), 0);
    }
}
