//! Process-wide RPC epoch tracker, the barrier primitive for migration's
//! write quiesce: increment the epoch, then wait until every RPC that began
//! in an earlier epoch has drained.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Tracks the current epoch and the set of outstanding RPC epochs.
#[derive(Debug, Default)]
pub struct EpochTracker {
    current: AtomicU64,
    /// epoch -> number of RPCs still running that started in it
    outstanding: Mutex<BTreeMap<u64, usize>>,
}

impl EpochTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Current epoch value.
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    /// Bumps the epoch, returning the *previous* value (the last epoch any
    /// already-running RPC could belong to).
    pub fn increment(&self) -> u64 {
        self.current.fetch_add(1, Ordering::AcqRel)
    }

    /// Registers an RPC beginning now; the guard deregisters on drop.
    pub fn rpc_begin(self: &Arc<Self>) -> EpochGuard {
        let epoch = self.current();
        let mut outstanding = self.outstanding.lock().unwrap();
        *outstanding.entry(epoch).or_insert(0) += 1;
        EpochGuard {
            tracker: self.clone(),
            epoch,
        }
    }

    /// The smallest epoch any outstanding RPC belongs to, or `u64::MAX` if
    /// none are running.
    pub fn earliest_outstanding(&self) -> u64 {
        let outstanding = self.outstanding.lock().unwrap();
        outstanding.keys().next().copied().unwrap_or(u64::MAX)
    }

    /// Waits (poll-loop style) until every RPC with epoch `<= fence` has
    /// completed.
    pub async fn wait_until_drained(&self, fence: u64) {
        loop {
            if self.earliest_outstanding() > fence {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    fn rpc_end(&self, epoch: u64) {
        let mut outstanding = self.outstanding.lock().unwrap();
        if let Some(count) = outstanding.get_mut(&epoch) {
            *count -= 1;
            if *count == 0 {
                outstanding.remove(&epoch);
            }
        }
    }
}

/// RAII registration of one running RPC in its starting epoch.
#[derive(Debug)]
pub struct EpochGuard {
    tracker: Arc<EpochTracker>,
    epoch: u64,
}

impl EpochGuard {
    /// The epoch this RPC is registered under.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Re-registers this RPC under the current epoch, so a barrier waiter
    /// does not wait on the waiter's own RPC.
    pub fn reregister_now(&mut self) {
        let new_epoch = self.tracker.current();
        if new_epoch != self.epoch {
            self.tracker.rpc_end(self.epoch);
            let mut outstanding = self.tracker.outstanding.lock().unwrap();
            *outstanding.entry(new_epoch).or_insert(0) += 1;
            self.epoch = new_epoch;
        }
    }
}

impl Drop for EpochGuard {
    fn drop(&mut self) {
        self.tracker.rpc_end(self.epoch);
    }
}

#[cfg(test)]
mod epoch_tests {
    use super::*;
    use tokio::time::{self, Duration};

    #[test]
    fn earliest_tracks_guards() {
        let tracker = EpochTracker::new();
        assert_eq!(tracker.earliest_outstanding(), u64::MAX);

        let g0 = tracker.rpc_begin();
        assert_eq!(g0.epoch(), 0);
        tracker.increment();
        let g1 = tracker.rpc_begin();
        assert_eq!(g1.epoch(), 1);
        assert_eq!(tracker.earliest_outstanding(), 0);

        drop(g0);
        assert_eq!(tracker.earliest_outstanding(), 1);
        drop(g1);
        assert_eq!(tracker.earliest_outstanding(), u64::MAX);
    }

    #[test]
    fn reregister_moves_guard_forward() {
        let tracker = EpochTracker::new();
        let mut guard = tracker.rpc_begin();
        tracker.increment();
        guard.reregister_now();
        assert_eq!(guard.epoch(), 1);
        assert_eq!(tracker.earliest_outstanding(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn barrier_waits_for_old_epoch_rpcs() {
        let tracker = EpochTracker::new();
        let old_rpc = tracker.rpc_begin();

        let fence = tracker.increment();
        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                tracker.wait_until_drained(fence).await;
            })
        };

        // the waiter cannot finish while the old RPC is outstanding
        time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(old_rpc);
        waiter.await.unwrap();
    }
}
