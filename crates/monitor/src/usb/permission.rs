//! Permission cache and broker
//!
//! The cache records which devices had permission as of the last check.
//! Presence means granted at that time; absence only means unknown. It is
//! rebuilt from live queries on every reconciliation pass rather than
//! trusted incrementally.
//!
//! The broker decides what a permission request turns into: an immediate
//! connect when the platform already grants access, a prompt whose answer
//! arrives later on the event channel, or a cancel.

use crate::usb::host::UsbHost;
use crate::usb::identity::DeviceKey;
use common::UsbDevice;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

/// Devices with permission granted as of their last check
///
/// Entries hold the snapshot seen at that check, never a live handle.
#[derive(Debug, Default)]
pub struct PermissionCache {
    granted: RwLock<HashMap<DeviceKey, UsbDevice>>,
}

impl PermissionCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<DeviceKey, UsbDevice>> {
        self.granted.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<DeviceKey, UsbDevice>> {
        self.granted.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, key: DeviceKey, device: UsbDevice) {
        self.write().insert(key, device);
    }

    pub fn remove(&self, key: &DeviceKey) -> Option<UsbDevice> {
        self.write().remove(key)
    }

    pub fn contains(&self, key: &DeviceKey) -> bool {
        self.read().contains_key(key)
    }

    pub fn get(&self, key: &DeviceKey) -> Option<UsbDevice> {
        self.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    /// Record the live permission state of `device`
    pub fn update(&self, key: DeviceKey, device: &UsbDevice, granted: bool) {
        if granted {
            self.insert(key, device.clone());
        } else {
            self.remove(&key);
        }
    }

    /// Replace the cache with a fresh live check of `devices`
    ///
    /// Returns the number of devices granted.
    pub fn rebuild<F>(&self, host: &dyn UsbHost, devices: &[UsbDevice], key_of: F) -> usize
    where
        F: Fn(&UsbDevice) -> DeviceKey,
    {
        let fresh: HashMap<DeviceKey, UsbDevice> = devices
            .iter()
            .filter(|d| host.has_permission(d))
            .map(|d| (key_of(d), d.clone()))
            .collect();

        let count = fresh.len();
        *self.write() = fresh;
        count
    }
}

/// Result of [`Monitor::request_permission`](crate::usb::Monitor::request_permission)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PermissionRequest {
    /// Permission already held; a connect is queued
    Granted,
    /// A prompt was issued; the answer arrives on the event channel
    Pending,
    /// The request could not be made; `on_cancel` is queued
    Cancelled,
}

/// Next lifecycle step a permission decision produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerStep {
    Connect,
    AwaitResponse,
    Cancel,
}

/// Issues permission requests against the host platform
#[derive(Clone)]
pub struct PermissionBroker {
    host: Arc<dyn UsbHost>,
}

impl PermissionBroker {
    pub fn new(host: Arc<dyn UsbHost>) -> Self {
        Self { host }
    }

    /// Live platform check, bypassing the cache
    pub fn is_granted(&self, device: &UsbDevice) -> bool {
        self.host.has_permission(device)
    }

    /// Request permission for `device`
    ///
    /// Each step is handed to `dispatch` in order. `AwaitResponse` is
    /// dispatched before the prompt goes out so that an answer delivered
    /// immediately still finds the device pending. Answers are correlated by
    /// device only; a second request before the first resolves is legal and
    /// both are satisfied by the same answer.
    pub fn request<F>(&self, device: &UsbDevice, registered: bool, mut dispatch: F) -> PermissionRequest
    where
        F: FnMut(BrokerStep),
    {
        if !registered {
            debug!("Not registered, cancelling permission request for {}", device.name);
            dispatch(BrokerStep::Cancel);
            return PermissionRequest::Cancelled;
        }

        if self.host.has_permission(device) {
            debug!("Permission already granted for {}", device.name);
            dispatch(BrokerStep::Connect);
            return PermissionRequest::Granted;
        }

        dispatch(BrokerStep::AwaitResponse);
        match self.host.request_permission(device) {
            Ok(()) => {
                debug!("Permission prompt issued for {}", device.name);
                PermissionRequest::Pending
            }
            Err(e) => {
                warn!("Could not request permission for {}: {}", device.name, e);
                dispatch(BrokerStep::Cancel);
                PermissionRequest::Cancelled
            }
        }
    }

    /// Map an asynchronous answer to the step it triggers
    pub fn on_result(granted: bool) -> BrokerStep {
        if granted {
            BrokerStep::Connect
        } else {
            BrokerStep::Cancel
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockHost, PromptAnswer};
    use crate::usb::identity::KeyOptions;
    use common::test_utils::{create_mock_device, create_mock_device_list};

    fn key(device: &UsbDevice) -> DeviceKey {
        DeviceKey::new(device, None, KeyOptions { with_serial: false, extended: false })
    }

    fn run(host: &Arc<MockHost>, device: &UsbDevice, registered: bool) -> (PermissionRequest, Vec<BrokerStep>) {
        let broker = PermissionBroker::new(host.clone());
        let mut steps = Vec::new();
        let result = broker.request(device, registered, |step| steps.push(step));
        (result, steps)
    }

    #[test]
    fn test_unregistered_cancels() {
        let host = Arc::new(MockHost::new());
        let device = create_mock_device(1, 0x1234, 0x5678);
        host.grant(&device);

        let (result, steps) = run(&host, &device, false);

        assert_eq!(result, PermissionRequest::Cancelled);
        assert_eq!(steps, vec![BrokerStep::Cancel]);
        assert_eq!(host.prompt_count(), 0);
    }

    #[test]
    fn test_already_granted_connects_without_prompt() {
        let host = Arc::new(MockHost::new());
        let device = create_mock_device(1, 0x1234, 0x5678);
        host.grant(&device);

        let (result, steps) = run(&host, &device, true);

        assert_eq!(result, PermissionRequest::Granted);
        assert_eq!(steps, vec![BrokerStep::Connect]);
        assert_eq!(host.prompt_count(), 0);
    }

    #[test]
    fn test_prompt_awaits_response() {
        let host = Arc::new(MockHost::new());
        host.set_prompt_answer(PromptAnswer::Pending);
        let device = create_mock_device(1, 0x1234, 0x5678);

        let (result, steps) = run(&host, &device, true);

        assert_eq!(result, PermissionRequest::Pending);
        assert_eq!(steps, vec![BrokerStep::AwaitResponse]);
        assert_eq!(host.prompt_count(), 1);
    }

    #[test]
    fn test_prompt_failure_cancels() {
        let host = Arc::new(MockHost::new());
        host.set_prompt_answer(PromptAnswer::Fail);
        let device = create_mock_device(1, 0x1234, 0x5678);

        let (result, steps) = run(&host, &device, true);

        assert_eq!(result, PermissionRequest::Cancelled);
        assert_eq!(steps, vec![BrokerStep::AwaitResponse, BrokerStep::Cancel]);
    }

    #[test]
    fn test_on_result() {
        assert_eq!(PermissionBroker::on_result(true), BrokerStep::Connect);
        assert_eq!(PermissionBroker::on_result(false), BrokerStep::Cancel);
    }

    #[test]
    fn test_rebuild_replaces_stale_entries() {
        let host = MockHost::new();
        let devices = create_mock_device_list(3);
        let cache = PermissionCache::new();

        let stale = create_mock_device(9, 0x9999, 0x9999);
        cache.insert(key(&stale), stale.clone());
        host.grant(&devices[0]);
        host.grant(&devices[2]);

        let count = cache.rebuild(&host, &devices, key);

        assert_eq!(count, 2);
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&key(&stale)));
        assert!(cache.contains(&key(&devices[2])));
    }

    #[test]
    fn test_update_removes_on_revoke() {
        let cache = PermissionCache::new();
        let device = create_mock_device(1, 0x1234, 0x5678);

        cache.update(key(&device), &device, true);
        assert!(cache.contains(&key(&device)));

        cache.update(key(&device), &device, false);
        assert!(cache.is_empty());
    }
}
