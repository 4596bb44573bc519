//! Event channel between the host event source and the monitor worker
//!
//! The event source (hot-plug callbacks, permission prompt answers) runs on
//! whatever thread the platform delivers on. It only ever enqueues; the
//! monitor worker drains the receiving end. The channel is unbounded so a
//! delivery context is never stalled by a busy worker.

use crate::usb_types::UsbDevice;
use async_channel::{Receiver, Sender, TryRecvError, unbounded};

/// Inbound signals from the host platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// Device attached. Not every platform delivers this reliably.
    Attached(UsbDevice),

    /// Device removed
    Detached(UsbDevice),

    /// Answer to a permission prompt, correlated by device only
    PermissionResult {
        device: UsbDevice,
        granted: bool,
    },
}

/// Sending half, handed to host backends
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<HostEvent>,
}

impl EventSender {
    /// Enqueue an event without blocking
    pub fn send(&self, event: HostEvent) -> crate::Result<()> {
        self.tx
            .try_send(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    pub fn attached(&self, device: UsbDevice) -> crate::Result<()> {
        self.send(HostEvent::Attached(device))
    }

    pub fn detached(&self, device: UsbDevice) -> crate::Result<()> {
        self.send(HostEvent::Detached(device))
    }

    pub fn permission_result(&self, device: UsbDevice, granted: bool) -> crate::Result<()> {
        self.send(HostEvent::PermissionResult { device, granted })
    }
}

/// Receiving half, owned by the monitor worker
#[derive(Debug)]
pub struct EventReceiver {
    rx: Receiver<HostEvent>,
}

impl EventReceiver {
    /// Wait for the next event
    pub async fn recv(&self) -> crate::Result<HostEvent> {
        self.rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Take an already queued event, if any
    pub fn try_recv(&self) -> Option<HostEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
        }
    }

    /// Number of events waiting
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Create the event channel
///
/// Returns (EventSender for the event source, EventReceiver for the worker)
pub fn create_event_channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = unbounded();
    (EventSender { tx }, EventReceiver { rx })
}
