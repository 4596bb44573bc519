//! Connection pool
//!
//! Maps device identity keys to the open control block for that device, at
//! most one per key. Reads are safe from any thread; inserts and removals
//! only happen on the monitor worker, which is what keeps concurrent
//! connects for one device down to a single native open.
//!
//! A block closed off the worker stays in the map until the worker drops
//! it. Readers never see such an entry: lookups and counts skip closed
//! blocks.

use crate::usb::control_block::{BlockOwner, ControlBlock};
use crate::usb::host::UsbHost;
use crate::usb::identity::DeviceKey;
use common::{Result, UsbDevice};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tracing::debug;

/// Outcome of [`ConnectionPool::open_or_reuse`]
#[derive(Debug, Clone)]
pub enum Connection {
    /// A block was already pooled for the key; no native open happened
    Reused(Arc<ControlBlock>),
    /// A native handle was opened and pooled
    Created(Arc<ControlBlock>),
}

impl Connection {
    pub fn block(&self) -> &Arc<ControlBlock> {
        match self {
            Connection::Reused(block) | Connection::Created(block) => block,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Connection::Created(_))
    }

    pub fn into_block(self) -> Arc<ControlBlock> {
        match self {
            Connection::Reused(block) | Connection::Created(block) => block,
        }
    }
}

#[derive(Default)]
pub struct ConnectionPool {
    blocks: RwLock<HashMap<DeviceKey, Arc<ControlBlock>>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<DeviceKey, Arc<ControlBlock>>> {
        self.blocks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<DeviceKey, Arc<ControlBlock>>> {
        self.blocks.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open block pooled under `key`
    pub fn get(&self, key: &DeviceKey) -> Option<Arc<ControlBlock>> {
        self.read().get(key).filter(|b| !b.is_closed()).cloned()
    }

    pub fn contains(&self, key: &DeviceKey) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.read().values().filter(|b| !b.is_closed()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<DeviceKey> {
        self.read()
            .iter()
            .filter(|(_, b)| !b.is_closed())
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Pool `block` under `key`, returning any block it displaced
    pub fn insert(&self, key: DeviceKey, block: Arc<ControlBlock>) -> Option<Arc<ControlBlock>> {
        self.write().insert(key, block)
    }

    pub fn remove(&self, key: &DeviceKey) -> Option<Arc<ControlBlock>> {
        self.write().remove(key)
    }

    /// Remove the entry for `key` only if it still holds `block`
    ///
    /// A closing block must not evict a newer block opened under the same key.
    pub fn remove_if_same(&self, key: &DeviceKey, block: &ControlBlock) -> Option<Arc<ControlBlock>> {
        let mut blocks = self.write();
        match blocks.get(key) {
            Some(current) if std::ptr::eq(Arc::as_ptr(current), block) => blocks.remove(key),
            _ => None,
        }
    }

    /// Take every pooled block, leaving the pool empty
    pub fn drain(&self) -> Vec<(DeviceKey, Arc<ControlBlock>)> {
        self.write().drain().collect()
    }

    /// Return the pooled block for `key`, or open and pool a new one
    ///
    /// Permission must already be granted. Only the monitor worker calls
    /// this, so the lookup and the insert cannot interleave with another
    /// open for the same key. A pooled block that is closed or closing is
    /// evicted and replaced.
    pub fn open_or_reuse(
        &self,
        host: &dyn UsbHost,
        device: &UsbDevice,
        key: &DeviceKey,
        owner: Weak<dyn BlockOwner>,
    ) -> Result<Connection> {
        let pooled = self.read().get(key).cloned();
        if let Some(block) = pooled {
            if !block.is_closed() {
                debug!("Reusing control block for {}", key);
                return Ok(Connection::Reused(block));
            }
            debug!("Evicting closed control block for {}", key);
            self.remove_if_same(key, &block);
        }

        let block = ControlBlock::open(host, device, key.clone(), Some(owner))?;
        self.insert(key.clone(), Arc::clone(&block));
        Ok(Connection::Created(block))
    }
}
