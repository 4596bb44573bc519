//! Listener contract
//!
//! All callbacks run on the monitor worker thread. A collaborator that owns
//! a UI or an async runtime must re-dispatch onto its own context before
//! touching its state; [`ChannelListener`] does that with a channel.

use crate::usb::control_block::ControlBlock;
use crate::usb::identity::DeviceKey;
use async_channel::{Receiver, Sender};
use common::UsbDevice;
use std::sync::Arc;
use tracing::debug;

/// Device lifecycle callbacks
pub trait DeviceListener: Send + Sync {
    /// Device attached, or re-announced by reconciliation
    fn on_attach(&self, device: &UsbDevice);

    /// Device removed; fires after `on_disconnect` for an open device
    fn on_detach(&self, device: &UsbDevice);

    /// Device connected. `created` is false when an already pooled
    /// block was reused.
    fn on_connect(&self, device: &UsbDevice, block: &Arc<ControlBlock>, created: bool);

    /// Block closed. The block is already closed when this fires.
    fn on_disconnect(&self, device: &UsbDevice, block: &ControlBlock);

    /// Permission denied or could not be requested
    fn on_cancel(&self, device: &UsbDevice);
}

/// A listener callback as a value
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    Attached(UsbDevice),
    Detached(UsbDevice),
    Connected {
        device: UsbDevice,
        block: Arc<ControlBlock>,
        created: bool,
    },
    Disconnected {
        device: UsbDevice,
        key: DeviceKey,
    },
    Cancelled(UsbDevice),
}

impl MonitorEvent {
    pub fn device(&self) -> &UsbDevice {
        match self {
            MonitorEvent::Attached(device)
            | MonitorEvent::Detached(device)
            | MonitorEvent::Cancelled(device)
            | MonitorEvent::Connected { device, .. }
            | MonitorEvent::Disconnected { device, .. } => device,
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            MonitorEvent::Attached(_) => "attach",
            MonitorEvent::Detached(_) => "detach",
            MonitorEvent::Connected { .. } => "connect",
            MonitorEvent::Disconnected { .. } => "disconnect",
            MonitorEvent::Cancelled(_) => "cancel",
        }
    }
}

/// Forwards every callback into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: Sender<MonitorEvent>,
}

impl ChannelListener {
    /// Create the listener and the receiving end of its channel
    pub fn new() -> (Self, Receiver<MonitorEvent>) {
        let (tx, rx) = async_channel::unbounded();
        (Self { tx }, rx)
    }

    fn forward(&self, event: MonitorEvent) {
        if self.tx.try_send(event).is_err() {
            debug!("Listener channel closed, dropping event");
        }
    }
}

impl DeviceListener for ChannelListener {
    fn on_attach(&self, device: &UsbDevice) {
        self.forward(MonitorEvent::Attached(device.clone()));
    }

    fn on_detach(&self, device: &UsbDevice) {
        self.forward(MonitorEvent::Detached(device.clone()));
    }

    fn on_connect(&self, device: &UsbDevice, block: &Arc<ControlBlock>, created: bool) {
        self.forward(MonitorEvent::Connected {
            device: device.clone(),
            block: Arc::clone(block),
            created,
        });
    }

    fn on_disconnect(&self, device: &UsbDevice, block: &ControlBlock) {
        let (key, _) = block.identity();
        self.forward(MonitorEvent::Disconnected {
            device: device.clone(),
            key: key.clone(),
        });
    }

    fn on_cancel(&self, device: &UsbDevice) {
        self.forward(MonitorEvent::Cancelled(device.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::create_mock_device;

    #[test]
    fn test_channel_listener_forwards_in_order() {
        let (listener, rx) = ChannelListener::new();
        let device = create_mock_device(1, 0x1234, 0x5678);

        listener.on_attach(&device);
        listener.on_cancel(&device);
        listener.on_detach(&device);

        let kinds: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.kind())
            .collect();
        assert_eq!(kinds, vec!["attach", "cancel", "detach"]);
    }

    #[test]
    fn test_dropped_receiver_is_tolerated() {
        let (listener, rx) = ChannelListener::new();
        drop(rx);

        listener.on_attach(&create_mock_device(1, 0x1234, 0x5678));
    }
}
