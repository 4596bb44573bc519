//! Reconciliation loop
//!
//! Hot-plug attach notifications are not delivered reliably on every host,
//! so while the monitor is registered a periodic tick re-enumerates the
//! filtered devices and rebuilds the permission cache. When the enumerated
//! count rose since the last announce, or the rebuilt cache holds more
//! grants than it did before the rebuild, every enumerated device is
//! announced again.
//! This is a conservative re-announce, not a diff: a device that was
//! already known gets a duplicate attach whenever another device shows up.
//! Detach notifications are assumed reliable and are not polled.

use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Default delay before the first tick after registering
pub const DEFAULT_FIRST_CHECK_DELAY: Duration = Duration::from_secs(1);
/// Default period between ticks
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(2);

/// Tick schedule and the counts compared between ticks
#[derive(Debug)]
pub struct ReconciliationLoop {
    first_delay: Duration,
    interval: Duration,
    next: Option<Instant>,
    device_count: usize,
}

impl ReconciliationLoop {
    pub fn new(first_delay: Duration, interval: Duration) -> Self {
        Self {
            first_delay,
            interval,
            next: None,
            device_count: 0,
        }
    }

    /// Schedule the first tick and forget previous counts
    pub fn start(&mut self) {
        self.device_count = 0;
        self.next = Some(Instant::now() + self.first_delay);
        debug!("Reconciliation scheduled in {:?}", self.first_delay);
    }

    /// Stop ticking; an in-progress tick is not interrupted
    pub fn stop(&mut self) {
        self.next = None;
    }

    pub fn is_running(&self) -> bool {
        self.next.is_some()
    }

    /// Forget the enumerated count so the next tick re-announces
    pub fn reset_count(&mut self) {
        self.device_count = 0;
    }

    pub fn device_count(&self) -> usize {
        self.device_count
    }

    /// Instant the next tick is due
    pub fn deadline(&self) -> Option<Instant> {
        self.next
    }

    /// Compare the counts of one tick
    ///
    /// `granted_before` is the cache size before the rebuild, `granted` after.
    /// Returns true when every enumerated device should be announced. The
    /// enumerated count is only remembered when it triggers an announce.
    pub fn observe(&mut self, device_count: usize, granted_before: usize, granted: usize) -> bool {
        let announce = device_count > self.device_count || granted > granted_before;
        if announce {
            debug!(
                "Reconcile: devices {} -> {}, granted {} -> {}",
                self.device_count, device_count, granted_before, granted
            );
            self.device_count = device_count;
        }
        announce
    }

    /// Schedule the tick after the one just run
    pub fn advance(&mut self) {
        if self.next.is_some() {
            self.next = Some(Instant::now() + self.interval);
        }
    }
}

/// Resolve at `deadline`; never resolves for `None`
pub async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Default for ReconciliationLoop {
    fn default() -> Self {
        Self::new(DEFAULT_FIRST_CHECK_DELAY, DEFAULT_CHECK_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_increase_announces() {
        let mut reconcile = ReconciliationLoop::default();
        reconcile.start();

        assert!(reconcile.observe(1, 0, 0));
        assert!(!reconcile.observe(1, 0, 0));
        assert!(reconcile.observe(2, 0, 0));
        assert_eq!(reconcile.device_count(), 2);
    }

    #[test]
    fn test_decrease_does_not_announce() {
        let mut reconcile = ReconciliationLoop::default();
        reconcile.start();
        reconcile.observe(3, 0, 1);

        assert!(!reconcile.observe(2, 1, 1));
        assert!(!reconcile.observe(2, 1, 0));
        assert!(reconcile.observe(2, 0, 1));
    }

    #[test]
    fn test_permission_increase_announces() {
        let mut reconcile = ReconciliationLoop::default();
        reconcile.start();
        reconcile.observe(2, 0, 0);

        assert!(reconcile.observe(2, 0, 1));
    }

    #[test]
    fn test_reset_count_reannounces() {
        let mut reconcile = ReconciliationLoop::default();
        reconcile.start();
        reconcile.observe(2, 0, 0);

        reconcile.reset_count();

        assert!(reconcile.observe(1, 0, 0));
    }

    #[test]
    fn test_stop_clears_deadline() {
        let mut reconcile = ReconciliationLoop::new(Duration::from_millis(10), Duration::from_millis(20));
        assert!(!reconcile.is_running());

        reconcile.start();
        assert!(reconcile.deadline().is_some());

        reconcile.stop();
        reconcile.advance();
        assert!(reconcile.deadline().is_none());
    }

    #[tokio::test]
    async fn test_wait_resolves_at_deadline() {
        let mut reconcile = ReconciliationLoop::new(Duration::from_millis(10), Duration::from_millis(20));
        reconcile.start();

        let waited = common::test_utils::with_timeout(Duration::from_secs(1), sleep_until(reconcile.deadline())).await;
        assert!(waited.is_ok());
    }

    #[tokio::test]
    async fn test_wait_pends_while_stopped() {
        let reconcile = ReconciliationLoop::default();

        let waited = common::test_utils::with_timeout(Duration::from_millis(50), sleep_until(reconcile.deadline())).await;
        assert!(waited.is_err());
    }
}
