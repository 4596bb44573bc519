//! USB subsystem
//!
//! Watches a host platform for device attach and detach, brokers
//! permission prompts, and keeps at most one open control block per
//! physical device.
//!
//! All state changes run on a single worker thread (see [`Monitor`]).
//! Public calls made from other threads are queued to that worker and,
//! where they return a value, wait for its reply.

pub mod control_block;
pub mod descriptor;
pub mod filter;
pub mod host;
pub mod identity;
pub mod listener;
pub mod monitor;
pub mod permission;
pub mod pool;
pub mod reconcile;
pub mod rusb_host;
mod worker;

// Re-export public types
pub use control_block::{BlockOwner, ControlBlock};
pub use filter::DeviceFilter;
pub use host::{EventWatch, NativeConnection, UsbHost};
pub use identity::{DeviceKey, KeyOptions};
pub use listener::{ChannelListener, DeviceListener, MonitorEvent};
pub use monitor::{DeviceState, Monitor, MonitorSettings};
pub use permission::{PermissionBroker, PermissionCache, PermissionRequest};
pub use pool::{Connection, ConnectionPool};
pub use reconcile::ReconciliationLoop;
pub use rusb_host::RusbHost;
