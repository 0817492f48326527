//! Named wait conditions for the long-poll hand-off.
//!
//! Each key (`task-for-<node>`) maps to a manual-reset event: `notify` sets
//! it, `clear` resets it, and waiters wake when it is set. Keys are created
//! lazily the first time someone waits on them and are never removed, so the
//! registry is bounded by the number of distinct nodes that ever polled.
//!
//! A wake is a hint. Callers re-check the ledger after every wake.

use dashmap::DashMap;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Signaled,
    TimedOut,
}

/// A registered interest in one key.
///
/// Obtain it before checking the condition you are waiting for; a notify
/// that lands between the check and [`Waiter::wait`] is then not lost.
/// Each waiter tracks the notifies it has seen on its own, so another
/// waiter's `clear` cannot swallow one it has not seen yet.
pub struct Waiter {
    key: String,
    rx: watch::Receiver<bool>,
    /// The condition was already set when this waiter registered.
    pending: bool,
}

impl Waiter {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns at once if a notify arrived since this waiter last woke,
    /// otherwise on the next notify or when `timeout` elapses.
    pub async fn wait(&mut self, timeout: Duration) -> WaitOutcome {
        let unseen = self.rx.has_changed().unwrap_or(false);
        if std::mem::take(&mut self.pending) || unseen {
            self.rx.borrow_and_update();
            return WaitOutcome::Signaled;
        }
        match tokio::time::timeout(timeout, self.rx.changed()).await {
            Ok(Ok(())) => WaitOutcome::Signaled,
            Ok(Err(_)) | Err(_) => WaitOutcome::TimedOut,
        }
    }
}

/// Process-wide registry of wait conditions.
#[derive(Default)]
pub struct DispatchCoordinator {
    conditions: DashMap<String, watch::Sender<bool>>,
}

impl DispatchCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in `key`, creating its condition if needed.
    pub fn waiter(&self, key: &str) -> Waiter {
        let mut rx = self
            .conditions
            .entry(key.to_string())
            .or_insert_with(|| watch::channel(false).0)
            .subscribe();
        let pending = *rx.borrow_and_update();
        Waiter {
            key: key.to_string(),
            rx,
            pending,
        }
    }

    /// Wait on `key` from scratch. Equivalent to `waiter(key).wait(timeout)`.
    pub async fn wait(&self, key: &str, timeout: Duration) -> WaitOutcome {
        self.waiter(key).wait(timeout).await
    }

    /// Signal `key`. With nobody waiting this does nothing, and in particular
    /// leaves no pending signal behind. Returns the number of waiters woken.
    pub fn notify(&self, key: &str) -> usize {
        let Some(condition) = self.conditions.get(key) else {
            debug!("notify {}: no condition", key);
            return 0;
        };
        let waiters = condition.receiver_count();
        if waiters == 0 {
            debug!("notify {}: no waiters", key);
            return 0;
        }
        condition.send_replace(true);
        debug!("notify {}: woke {} waiter(s)", key, waiters);
        waiters
    }

    /// Reset `key` to unsignaled. Clearing never wakes anyone, and waiters
    /// that have not yet seen an earlier notify still see it.
    pub fn clear(&self, key: &str) {
        if let Some(condition) = self.conditions.get(key) {
            condition.send_if_modified(|set| {
                *set = false;
                false
            });
        }
    }

    pub fn is_signaled(&self, key: &str) -> bool {
        self.conditions
            .get(key)
            .map(|condition| *condition.value().borrow())
            .unwrap_or(false)
    }

    /// Number of live waiters on `key`.
    pub fn waiting(&self, key: &str) -> usize {
        self.conditions
            .get(key)
            .map(|condition| condition.receiver_count())
            .unwrap_or(0)
    }

    pub fn registered_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.conditions.iter().map(|c| c.key().clone()).collect();
        keys.sort();
        keys
    }
}
