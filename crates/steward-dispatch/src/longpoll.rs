//! Long-poll task delivery.
//!
//! The loop registers a waiter, checks the ledger, and only then sleeps.
//! A wake is followed by `clear` and another check, since the task that
//! caused it may already be gone or not yet visible.

use crate::coordinator::WaitOutcome;
use crate::ledger::{Task, TaskLedger};
use std::time::Duration;
use steward_core::{task_key, EntityId, Result};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

impl TaskLedger {
    /// Wait up to `timeout` for a pending task on `node_id` and return it
    /// unchanged. `None` means the poll timed out.
    pub async fn long_poll(&self, node_id: EntityId, timeout: Duration) -> Result<Option<Task>> {
        let never = CancellationToken::new();
        self.poll_loop(node_id, timeout, &never, || Ok(self.claim_next_pending(node_id)))
            .await
    }

    /// Wait for a pending task and claim it as delivered. Gives up on timeout
    /// or when `cancel` fires, leaving any pending task for the next poller.
    pub async fn long_poll_deliver(
        &self,
        node_id: EntityId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<Task>> {
        self.poll_loop(node_id, timeout, cancel, || self.deliver_next(node_id))
            .await
    }

    async fn poll_loop<F>(
        &self,
        node_id: EntityId,
        timeout: Duration,
        cancel: &CancellationToken,
        mut take: F,
    ) -> Result<Option<Task>>
    where
        F: FnMut() -> Result<Option<Task>>,
    {
        let key = task_key(node_id);
        let deadline = Instant::now() + timeout;
        let mut waiter = self.coordinator().waiter(&key);

        loop {
            if let Some(task) = take()? {
                return Ok(Some(task));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!("Poll for node {} timed out", node_id);
                return Ok(None);
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Poll for node {} abandoned", node_id);
                    return Ok(None);
                }
                outcome = waiter.wait(remaining) => outcome,
            };
            if outcome == WaitOutcome::Signaled {
                self.coordinator().clear(&key);
            }
        }
    }
}
