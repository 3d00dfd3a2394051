//! Deferred cancellation after a client disconnect.
//!
//! A transport disconnect does not cancel a run immediately: the guard arms a
//! one-shot timer and cancels the run's token only if the grace period passes
//! without the run completing or the client reconnecting.

use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Disconnect grace guard bound to one run.
pub struct DisconnectGuard {
    run_id: String,
    cancel: CancellationToken,
    done: CancellationToken,
    grace: Duration,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl DisconnectGuard {
    /// Guard `cancel` for `run_id`, waiting `grace` after a disconnect.
    pub fn new(run_id: impl Into<String>, cancel: CancellationToken, grace: Duration) -> Self {
        Self {
            run_id: run_id.into(),
            cancel,
            done: CancellationToken::new(),
            grace,
            timer: Mutex::new(None),
        }
    }

    /// Handle a client disconnect. Returns false when nothing was armed
    /// because the run already finished, was cancelled, or a timer is pending.
    pub fn disconnected(&self) -> bool {
        if self.done.is_cancelled() || self.cancel.is_cancelled() {
            debug!(run_id = %self.run_id, "Disconnect after run finished, ignoring");
            return false;
        }

        let mut timer = self.timer.lock().unwrap_or_else(|e| e.into_inner());
        if timer.as_ref().is_some_and(|t| !t.is_finished()) {
            return false;
        }

        let cancel = self.cancel.clone();
        let done = self.done.clone();
        let run_id = self.run_id.clone();
        let grace = self.grace;
        *timer = Some(tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(grace) => {
                    if !done.is_cancelled() && !cancel.is_cancelled() {
                        info!(run_id = %run_id, ?grace, "Client did not return, cancelling run");
                        cancel.cancel();
                    }
                }
                _ = done.cancelled() => {}
                _ = cancel.cancelled() => {}
            }
        }));
        debug!(run_id = %self.run_id, grace = ?self.grace, "Disconnect grace armed");
        true
    }

    /// The client came back within the grace window; keep the run alive.
    pub fn reconnected(&self) {
        if let Some(timer) = self.take_timer() {
            timer.abort();
            debug!(run_id = %self.run_id, "Client reconnected, grace cleared");
        }
    }

    /// The run finished; any pending timer is cleared.
    pub fn complete(&self) {
        self.done.cancel();
        if let Some(timer) = self.take_timer() {
            timer.abort();
        }
    }

    /// Whether a disconnect timer is currently pending.
    pub fn is_armed(&self) -> bool {
        self.timer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    fn take_timer(&self) -> Option<JoinHandle<()>> {
        self.timer.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        self.complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancels_after_grace() {
        let token = CancellationToken::new();
        let guard = DisconnectGuard::new("r1", token.clone(), Duration::from_millis(20));
        assert!(guard.disconnected());
        assert!(guard.is_armed());
        assert!(!token.is_cancelled());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn completion_clears_timer() {
        let token = CancellationToken::new();
        let guard = DisconnectGuard::new("r1", token.clone(), Duration::from_millis(20));
        guard.disconnected();
        guard.complete();
        assert!(!guard.is_armed());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!token.is_cancelled());
        // A disconnect after completion is skipped.
        assert!(!guard.disconnected());
    }

    #[tokio::test]
    async fn reconnect_keeps_run() {
        let token = CancellationToken::new();
        let guard = DisconnectGuard::new("r1", token.clone(), Duration::from_millis(20));
        guard.disconnected();
        guard.reconnected();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!token.is_cancelled());
        // Can be armed again after reconnecting.
        assert!(guard.disconnected());
    }

    #[tokio::test]
    async fn skips_already_cancelled_run() {
        let token = CancellationToken::new();
        token.cancel();
        let guard = DisconnectGuard::new("r1", token, Duration::from_millis(20));
        assert!(!guard.disconnected());
    }
}
