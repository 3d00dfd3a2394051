//! Durable transport seam.
//!
//! The runtime only needs at-least-once delivery of [`QueueJob`]s. A broker
//! client implements [`QueueBackend`]; [`MemoryQueue`] is the in-process
//! implementation used by the worker binary and the tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{QueueError, Result};
use crate::handoff::message::HandoffMessage;

/// Retained completed and failed jobs kept by default, each.
pub const DEFAULT_RETAINED_JOBS: usize = 1000;

/// Per-job delivery options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Hold the job back for this long before it becomes visible.
    pub delay: Option<Duration>,
    /// Forget the job once it completes.
    pub remove_on_complete: bool,
    /// Retain the job after failure for inspection.
    pub keep_on_fail: bool,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            delay: None,
            remove_on_complete: true,
            keep_on_fail: true,
        }
    }
}

impl EnqueueOptions {
    /// Default options with a delivery delay.
    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }
}

/// One queued delivery. The payload is the envelope verbatim.
#[derive(Debug, Clone)]
pub struct QueueJob {
    pub message: HandoffMessage,
    pub options: EnqueueOptions,
}

impl QueueJob {
    /// Wrap `message` for delivery.
    pub fn new(message: HandoffMessage, options: EnqueueOptions) -> Self {
        Self { message, options }
    }
}

/// A job the backend retained after failure.
#[derive(Debug, Clone)]
pub struct FailedJob {
    pub job: QueueJob,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// At-least-once job transport.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Enqueue a job, honouring `options.delay`.
    async fn push(&self, job: QueueJob) -> Result<()>;

    /// Wait for the next job. `None` once the backend is closed.
    async fn next(&self) -> Option<QueueJob>;

    /// Acknowledge successful handling.
    async fn complete(&self, job: &QueueJob) -> Result<()>;

    /// Record a terminal failure.
    async fn fail(&self, job: &QueueJob, reason: &str) -> Result<()>;

    /// Stop delivering. Pending and delayed jobs are dropped.
    async fn close(&self);
}

/// In-process backend over an unbounded channel.
///
/// Retained completed and failed jobs are bounded: once `retention` is
/// reached the oldest entry is evicted. Use [`MemoryQueue::drain_failed`] to
/// hand failures off to external storage.
pub struct MemoryQueue {
    tx: mpsc::UnboundedSender<QueueJob>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<QueueJob>>,
    closed: CancellationToken,
    retention: usize,
    completed: Mutex<VecDeque<QueueJob>>,
    failed: Mutex<VecDeque<FailedJob>>,
}

impl MemoryQueue {
    /// Create a queue retaining up to [`DEFAULT_RETAINED_JOBS`] of each kind.
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETAINED_JOBS)
    }

    /// Create a queue retaining at most `retention` completed and
    /// `retention` failed jobs. Zero disables retention.
    pub fn with_retention(retention: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            closed: CancellationToken::new(),
            retention,
            completed: Mutex::new(VecDeque::new()),
            failed: Mutex::new(VecDeque::new()),
        }
    }

    /// Snapshot of failed jobs retained with `keep_on_fail`, oldest first.
    pub fn failed_jobs(&self) -> Vec<FailedJob> {
        lock(&self.failed).iter().cloned().collect()
    }

    /// Snapshot of completed jobs retained because `remove_on_complete` was
    /// off, oldest first.
    pub fn completed_jobs(&self) -> Vec<QueueJob> {
        lock(&self.completed).iter().cloned().collect()
    }

    /// Take every retained failed job, leaving the list empty.
    pub fn drain_failed(&self) -> Vec<FailedJob> {
        lock(&self.failed).drain(..).collect()
    }

    /// Take every retained completed job, leaving the list empty.
    pub fn drain_completed(&self) -> Vec<QueueJob> {
        lock(&self.completed).drain(..).collect()
    }

    /// Whether [`QueueBackend::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn send_now(&self, job: QueueJob) -> Result<()> {
        self.tx.send(job).map_err(|_| QueueError::Closed)?;
        Ok(())
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn push(&self, job: QueueJob) -> Result<()> {
        if self.is_closed() {
            return Err(QueueError::Closed.into());
        }

        match job.options.delay.filter(|d| !d.is_zero()) {
            None => self.send_now(job),
            Some(delay) => {
                let tx = self.tx.clone();
                let closed = self.closed.clone();
                debug!(message_id = %job.message.id, ?delay, "Delaying job");
                tokio::spawn(async move {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {
                            let _ = tx.send(job);
                        }
                        _ = closed.cancelled() => {}
                    }
                });
                Ok(())
            }
        }
    }

    async fn next(&self) -> Option<QueueJob> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            job = rx.recv() => job,
        }
    }

    async fn complete(&self, job: &QueueJob) -> Result<()> {
        if !job.options.remove_on_complete {
            retain(&self.completed, job.clone(), self.retention);
        }
        Ok(())
    }

    async fn fail(&self, job: &QueueJob, reason: &str) -> Result<()> {
        if job.options.keep_on_fail {
            let failed = FailedJob {
                job: job.clone(),
                reason: reason.to_string(),
                failed_at: Utc::now(),
            };
            retain(&self.failed, failed, self.retention);
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

fn lock<T>(list: &Mutex<VecDeque<T>>) -> std::sync::MutexGuard<'_, VecDeque<T>> {
    list.lock().unwrap_or_else(|e| e.into_inner())
}

fn retain<T>(list: &Mutex<VecDeque<T>>, item: T, limit: usize) {
    if limit == 0 {
        return;
    }
    let mut list = lock(list);
    while list.len() >= limit {
        list.pop_front();
    }
    list.push_back(item);
}
