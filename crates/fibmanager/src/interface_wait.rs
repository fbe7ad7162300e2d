//! Holds local installation back until the owning interface is up while a
//! controlled upgrade is in progress.

use crate::collaborators::EgressService;
use crate::types::OperState;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// No upgrade in progress.
    NotRequired,
    AlreadyUp,
    CameUp,
    /// The deadline passed; the caller proceeds anyway.
    TimedOut,
    /// The interface cannot be watched.
    Unknown,
}

pub struct InterfaceWaiter {
    egress: Arc<dyn EgressService>,
    upgrade_in_progress: AtomicBool,
    timeout: Duration,
}

impl InterfaceWaiter {
    pub fn new(egress: Arc<dyn EgressService>, upgrade_in_progress: bool, timeout: Duration) -> Self {
        Self {
            egress,
            upgrade_in_progress: AtomicBool::new(upgrade_in_progress),
            timeout,
        }
    }

    pub fn set_upgrade_in_progress(&self, in_progress: bool) {
        let previous = self.upgrade_in_progress.swap(in_progress, Ordering::SeqCst);
        if previous != in_progress {
            info!("InterfaceWaiter: upgrade in progress set to {}", in_progress);
        }
    }

    pub fn upgrade_in_progress(&self) -> bool {
        self.upgrade_in_progress.load(Ordering::SeqCst)
    }

    /// Waits, bounded by the configured deadline, for `interface` to report
    /// up. Never fails: a timeout is logged and reported to the caller.
    pub async fn wait_until_up(&self, interface: &str) -> WaitOutcome {
        if !self.upgrade_in_progress() {
            return WaitOutcome::NotRequired;
        }

        let Some(mut rx) = self.egress.watch_interface_state(interface).await else {
            debug!("InterfaceWaiter: {} cannot be watched, not waiting", interface);
            return WaitOutcome::Unknown;
        };

        if *rx.borrow_and_update() == OperState::Up {
            return WaitOutcome::AlreadyUp;
        }

        debug!(
            "InterfaceWaiter: waiting up to {:?} for {} to come up",
            self.timeout, interface
        );
        let waited = tokio::time::timeout(self.timeout, rx.wait_for(|state| *state == OperState::Up))
            .await
            .map(|changed| changed.map(|_| ()));
        match waited {
            Ok(Ok(())) => {
                debug!("InterfaceWaiter: {} is up", interface);
                WaitOutcome::CameUp
            }
            Ok(Err(_)) => {
                warn!(
                    "InterfaceWaiter: state feed for {} closed, proceeding",
                    interface
                );
                WaitOutcome::Unknown
            }
            Err(_) => {
                warn!(
                    "InterfaceWaiter: {} still down after {:?}, proceeding",
                    interface, self.timeout
                );
                WaitOutcome::TimedOut
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::InMemoryFabric;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_no_wait_outside_upgrade() {
        let fabric = InMemoryFabric::new();
        fabric.set_interface_state("tap1", OperState::Down);
        let waiter = InterfaceWaiter::new(Arc::new(fabric), false, Duration::from_millis(10));
        assert_eq!(waiter.wait_until_up("tap1").await, WaitOutcome::NotRequired);
    }

    #[tokio::test]
    async fn test_times_out_and_proceeds() {
        let fabric = InMemoryFabric::new();
        fabric.set_interface_state("tap1", OperState::Down);
        let waiter = InterfaceWaiter::new(Arc::new(fabric), true, Duration::from_millis(10));
        assert_eq!(waiter.wait_until_up("tap1").await, WaitOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_wakes_when_interface_comes_up() {
        let fabric = InMemoryFabric::new();
        fabric.set_interface_state("tap1", OperState::Down);
        let waiter = InterfaceWaiter::new(Arc::new(fabric.clone()), true, Duration::from_secs(5));

        let flip = {
            let fabric = fabric.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                fabric.set_interface_state("tap1", OperState::Up);
            })
        };
        assert_eq!(waiter.wait_until_up("tap1").await, WaitOutcome::CameUp);
        flip.await.unwrap();
        assert_eq!(waiter.wait_until_up("tap1").await, WaitOutcome::AlreadyUp);
    }
}
