//! Pending-result correlator.
//!
//! Correlates a message id with one waiting caller. The entry settles exactly
//! once: by `resolve`, `reject`, `cancel`/`clear_all`, or its timeout timer.
//! Interim events published before settlement reach the waiter's callback in
//! publish order. Everything here is process-local.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, PendingError, Result};
use crate::handoff::processor::ProcessResult;

/// Receives interim events for a pending message.
pub type EventCallback = Arc<dyn Fn(Value) -> anyhow::Result<()> + Send + Sync>;

/// Callback forwarding events into an unbounded channel. Fails once the
/// receiver is gone.
pub fn channel_callback(tx: mpsc::UnboundedSender<Value>) -> EventCallback {
    Arc::new(move |event| {
        tx.send(event)
            .map_err(|_| anyhow::anyhow!("event receiver dropped"))
    })
}

/// Options for [`PendingResults::wait_for`].
#[derive(Clone, Default)]
pub struct WaitOptions {
    /// Overrides the correlator's default timeout.
    pub timeout: Option<Duration>,
    pub on_event: Option<EventCallback>,
}

impl WaitOptions {
    /// Wait at most `timeout` instead of the correlator default.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Receive interim events through `on_event`.
    pub fn with_on_event(mut self, on_event: EventCallback) -> Self {
        self.on_event = Some(on_event);
        self
    }
}

impl fmt::Debug for WaitOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitOptions")
            .field("timeout", &self.timeout)
            .field("on_event", &self.on_event.is_some())
            .finish()
    }
}

struct PendingEntry {
    tx: oneshot::Sender<Result<ProcessResult>>,
    on_event: Option<EventCallback>,
    timer: Option<JoinHandle<()>>,
    generation: u64,
}

type EntryMap = Arc<Mutex<HashMap<String, PendingEntry>>>;

/// Future of one registered wait.
///
/// Dropping it before it settles withdraws the waiter: the id becomes free
/// again and later events for it are not delivered.
#[must_use = "a pending wait does nothing unless awaited"]
pub struct PendingWait {
    id: String,
    rx: oneshot::Receiver<Result<ProcessResult>>,
    entries: EntryMap,
    generation: u64,
}

impl PendingWait {
    /// Message id this wait is registered for.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Future for PendingWait {
    type Output = Result<ProcessResult>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(PendingError::Dropped {
                id: this.id.clone(),
            }
            .into())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingWait {
    fn drop(&mut self) {
        let entry = {
            let mut map = lock(&self.entries);
            // Settled entries are already gone; a newer waiter may own the id.
            match map.get(&self.id) {
                Some(entry) if entry.generation == self.generation => map.remove(&self.id),
                _ => None,
            }
        };
        if let Some(entry) = entry {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
            debug!(message_id = %self.id, "Pending waiter dropped, withdrawing");
        }
    }
}

/// Process-local registry of waiters keyed by message id.
pub struct PendingResults {
    entries: EntryMap,
    generation: AtomicU64,
    default_timeout: Duration,
}

impl PendingResults {
    /// Create a correlator whose waits time out after `default_timeout`.
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            default_timeout,
        }
    }

    /// Register a waiter for `id` and arm its timeout.
    ///
    /// Fails with [`PendingError::AlreadyWaiting`] if `id` already has an
    /// unsettled waiter. Must be called from within a tokio runtime.
    pub fn wait_for(&self, id: &str, options: WaitOptions) -> Result<PendingWait> {
        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let mut entries = lock(&self.entries);
        if entries.contains_key(id) {
            return Err(PendingError::AlreadyWaiting { id: id.to_string() }.into());
        }

        let timer = tokio::spawn(expire_after(
            Arc::clone(&self.entries),
            id.to_string(),
            generation,
            timeout,
        ));
        entries.insert(
            id.to_string(),
            PendingEntry {
                tx,
                on_event: options.on_event,
                timer: Some(timer),
                generation,
            },
        );
        drop(entries);

        debug!(message_id = %id, ?timeout, "Registered pending waiter");
        Ok(PendingWait {
            id: id.to_string(),
            rx,
            entries: Arc::clone(&self.entries),
            generation,
        })
    }

    /// Settle `id` with an outcome. Returns false if nothing was waiting.
    pub fn resolve(&self, id: &str, result: ProcessResult) -> bool {
        self.settle(id, Ok(result))
    }

    /// Settle `id` with an error. Returns false if nothing was waiting.
    pub fn reject(&self, id: &str, error: Error) -> bool {
        self.settle(id, Err(error))
    }

    /// Forward an interim event to the waiter's callback.
    ///
    /// Returns false for unknown or settled ids and for waiters without a
    /// callback. A failing callback is logged; the entry is unaffected.
    pub fn publish(&self, id: &str, event: Value) -> bool {
        let callback = {
            let entries = lock(&self.entries);
            match entries.get(id).and_then(|e| e.on_event.clone()) {
                Some(cb) => cb,
                None => return false,
            }
        };

        if let Err(e) = callback(event) {
            warn!(message_id = %id, error = %e, "Pending event callback failed");
        }
        true
    }

    /// Reject one waiter as cancelled.
    pub fn cancel(&self, id: &str, reason: &str) -> bool {
        self.settle(
            id,
            Err(PendingError::Cancelled {
                id: id.to_string(),
                reason: reason.to_string(),
            }
            .into()),
        )
    }

    /// Reject every waiter as cancelled. Returns how many were rejected.
    pub fn clear_all(&self, reason: &str) -> usize {
        let drained: Vec<(String, PendingEntry)> = lock(&self.entries).drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
            let _ = entry.tx.send(Err(PendingError::Cancelled {
                id,
                reason: reason.to_string(),
            }
            .into()));
        }
        if count > 0 {
            debug!(count, reason, "Cleared pending waiters");
        }
        count
    }

    /// Whether `id` has an unsettled waiter.
    pub fn has(&self, id: &str) -> bool {
        lock(&self.entries).contains_key(id)
    }

    /// Number of unsettled waiters.
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Whether no waiter is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn settle(&self, id: &str, result: Result<ProcessResult>) -> bool {
        let Some(entry) = lock(&self.entries).remove(id) else {
            return false;
        };
        if let Some(timer) = entry.timer {
            timer.abort();
        }
        // The waiter may have stopped listening; the entry is gone either way.
        let _ = entry.tx.send(result);
        true
    }
}

async fn expire_after(entries: EntryMap, id: String, generation: u64, timeout: Duration) {
    tokio::time::sleep(timeout).await;

    let entry = {
        let mut map = lock(&entries);
        // A later waiter may have reused the id after this one settled.
        match map.get(&id) {
            Some(entry) if entry.generation == generation => map.remove(&id),
            _ => None,
        }
    };
    if let Some(entry) = entry {
        debug!(message_id = %id, ?timeout, "Pending waiter timed out");
        let _ = entry
            .tx
            .send(Err(PendingError::Timeout { id, timeout }.into()));
    }
}

fn lock(entries: &EntryMap) -> std::sync::MutexGuard<'_, HashMap<String, PendingEntry>> {
    entries.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pending() -> PendingResults {
        PendingResults::new(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn resolve_settles_once() {
        let pending = pending();
        let wait = pending.wait_for("m1", WaitOptions::default()).unwrap();
        assert_eq!(pending.len(), 1);

        assert!(pending.resolve("m1", ProcessResult::ok()));
        assert_eq!(pending.len(), 0);
        assert!(!pending.resolve("m1", ProcessResult::dead("late")));
        assert!(!pending.reject("m1", anyhow::anyhow!("late").into()));

        assert_eq!(wait.await.unwrap(), ProcessResult::ok());
    }

    #[tokio::test]
    async fn duplicate_waiter_rejected() {
        let pending = pending();
        let _wait = pending.wait_for("m1", WaitOptions::default()).unwrap();
        let err = pending.wait_for("m1", WaitOptions::default()).err().unwrap();
        assert!(matches!(
            err,
            Error::Pending(PendingError::AlreadyWaiting { .. })
        ));
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn id_reusable_after_settlement() {
        let pending = pending();
        let first = pending.wait_for("m1", WaitOptions::default()).unwrap();
        pending.resolve("m1", ProcessResult::ok());
        first.await.unwrap();

        let second = pending.wait_for("m1", WaitOptions::default()).unwrap();
        pending.resolve("m1", ProcessResult::dead("second"));
        assert_eq!(second.await.unwrap(), ProcessResult::dead("second"));
    }

    #[tokio::test]
    async fn reject_delivers_error() {
        let pending = pending();
        let wait = pending.wait_for("m1", WaitOptions::default()).unwrap();
        assert!(pending.reject("m1", anyhow::anyhow!("kaput").into()));
        let err = wait.await.unwrap_err();
        assert!(err.to_string().contains("kaput"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_rejects_and_removes() {
        let pending = pending();
        let wait = pending
            .wait_for(
                "m1",
                WaitOptions::default().with_timeout(Duration::from_millis(50)),
            )
            .unwrap();

        let err = wait.await.unwrap_err();
        assert!(err.is_timeout());
        assert!(!pending.has("m1"));
        assert!(!pending.resolve("m1", ProcessResult::ok()));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_timer_leaves_new_waiter_alone() {
        let pending = pending();
        let first = pending
            .wait_for("m1", WaitOptions::default().with_timeout(Duration::from_millis(50)))
            .unwrap();
        pending.resolve("m1", ProcessResult::ok());
        first.await.unwrap();

        let second = pending
            .wait_for("m1", WaitOptions::default().with_timeout(Duration::from_secs(10)))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(pending.has("m1"));
        pending.resolve("m1", ProcessResult::ok());
        second.await.unwrap();
    }

    #[tokio::test]
    async fn events_arrive_in_order_until_settled() {
        let pending = pending();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let wait = pending
            .wait_for(
                "m1",
                WaitOptions::default().with_on_event(channel_callback(tx)),
            )
            .unwrap();

        for step in 0..5 {
            assert!(pending.publish("m1", json!({ "step": step })));
        }
        pending.resolve("m1", ProcessResult::ok());
        wait.await.unwrap();

        assert!(!pending.publish("m1", json!({ "step": 99 })));
        assert!(!pending.publish("unknown", json!({})));

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event["step"].as_i64().unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn failing_callback_does_not_settle() {
        let pending = pending();
        let wait = pending
            .wait_for(
                "m1",
                WaitOptions::default()
                    .with_on_event(Arc::new(|_| Err(anyhow::anyhow!("listener broke")))),
            )
            .unwrap();

        assert!(pending.publish("m1", json!({})));
        assert!(pending.has("m1"));
        pending.resolve("m1", ProcessResult::ok());
        assert!(wait.await.is_ok());
    }

    #[tokio::test]
    async fn dropped_wait_withdraws_entry() {
        let pending = pending();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let wait = pending
            .wait_for("m1", WaitOptions::default().with_on_event(channel_callback(tx)))
            .unwrap();
        drop(wait);

        assert!(!pending.has("m1"));
        assert!(!pending.publish("m1", json!({ "late": true })));
        assert!(!pending.resolve("m1", ProcessResult::ok()));
        assert!(rx.try_recv().is_err());

        let again = pending.wait_for("m1", WaitOptions::default()).unwrap();
        pending.resolve("m1", ProcessResult::ok());
        assert_eq!(again.await.unwrap(), ProcessResult::ok());
    }

    #[tokio::test]
    async fn dropping_settled_wait_spares_newer_waiter() {
        let pending = pending();
        let first = pending.wait_for("m1", WaitOptions::default()).unwrap();
        pending.resolve("m1", ProcessResult::ok());

        let second = pending.wait_for("m1", WaitOptions::default()).unwrap();
        drop(first);
        assert!(pending.has("m1"));

        pending.resolve("m1", ProcessResult::dead("second"));
        assert_eq!(second.await.unwrap(), ProcessResult::dead("second"));
    }

    #[tokio::test]
    async fn clear_all_rejects_everyone() {
        let pending = pending();
        let a = pending.wait_for("a", WaitOptions::default()).unwrap();
        let b = pending.wait_for("b", WaitOptions::default()).unwrap();
        assert!(pending.cancel("a", "user left"));

        assert_eq!(pending.clear_all("shutdown"), 1);
        assert!(pending.is_empty());

        assert!(a.await.unwrap_err().to_string().contains("user left"));
        assert!(b.await.unwrap_err().to_string().contains("shutdown"));
    }
}
