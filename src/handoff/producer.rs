//! Producer side of the durable queue.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::handoff::backend::{EnqueueOptions, QueueBackend, QueueJob};
use crate::handoff::message::HandoffMessage;
use crate::handoff::pending::{PendingResults, WaitOptions};
use crate::handoff::processor::ProcessResult;

/// Envelope version stamped on messages that carry none.
pub const MESSAGE_VERSION: u32 = 1;

/// Normalizes and enqueues messages, optionally waiting for their outcome.
pub struct HandoffQueue {
    backend: Arc<dyn QueueBackend>,
    pending: Arc<PendingResults>,
    default_max_attempts: u32,
}

impl HandoffQueue {
    /// Create a producer stamping `default_max_attempts` on messages without one.
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        pending: Arc<PendingResults>,
        default_max_attempts: u32,
    ) -> Self {
        Self {
            backend,
            pending,
            default_max_attempts,
        }
    }

    /// Fill transport defaults: id, version, attempt, max attempts and
    /// enqueue time. Fields already set are kept.
    pub fn normalize(&self, mut message: HandoffMessage) -> HandoffMessage {
        if message.id.is_empty() {
            message.id = Uuid::new_v4().to_string();
        }
        if message.version == 0 {
            message.version = MESSAGE_VERSION;
        }
        if message.attempt == 0 {
            message.attempt = 1;
        }
        if message.max_attempts == 0 {
            message.max_attempts = self.default_max_attempts;
        }
        if message.enqueued_at.is_none() {
            message.enqueued_at = Some(Utc::now());
        }
        message
    }

    /// Normalize and enqueue. Returns the message id.
    pub async fn enqueue(&self, message: HandoffMessage, options: EnqueueOptions) -> Result<String> {
        let message = self.normalize(message);
        let id = message.id.clone();
        debug!(
            message_id = %id,
            message_type = %message.message_type,
            attempt = message.attempt,
            delay = ?options.delay,
            "Enqueueing message"
        );
        self.backend.push(QueueJob::new(message, options)).await?;
        Ok(id)
    }

    /// Enqueue and block until the message settles.
    ///
    /// The waiter is registered before the push so no outcome or event can
    /// be missed. If the push fails the waiter is withdrawn and the push
    /// error returned.
    pub async fn enqueue_and_wait(
        &self,
        message: HandoffMessage,
        options: EnqueueOptions,
        wait: WaitOptions,
    ) -> Result<ProcessResult> {
        let message = self.normalize(message);
        let id = message.id.clone();
        let waiter = self.pending.wait_for(&id, wait)?;

        if let Err(e) = self.enqueue(message, options).await {
            warn!(message_id = %id, error = %e, "Enqueue failed, withdrawing waiter");
            self.pending.cancel(&id, "enqueue failed");
            return Err(e);
        }

        waiter.await
    }

    /// The correlator used by [`HandoffQueue::enqueue_and_wait`].
    pub fn pending(&self) -> &Arc<PendingResults> {
        &self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::error::Error;
    use crate::handoff::backend::MemoryQueue;

    fn producer(backend: Arc<MemoryQueue>) -> HandoffQueue {
        HandoffQueue::new(
            backend,
            Arc::new(PendingResults::new(Duration::from_secs(5))),
            3,
        )
    }

    #[tokio::test]
    async fn normalize_fills_defaults_only() {
        let queue = producer(Arc::new(MemoryQueue::new()));
        let filled = queue.normalize(HandoffMessage::new("agent.chat.v1"));
        assert!(Uuid::parse_str(&filled.id).is_ok());
        assert_eq!(filled.version, 1);
        assert_eq!(filled.attempt, 1);
        assert_eq!(filled.max_attempts, 3);
        assert!(filled.enqueued_at.is_some());

        let mut custom = HandoffMessage::new("agent.chat.v1")
            .with_id("m1")
            .with_max_attempts(7);
        custom.attempt = 2;
        let kept = queue.normalize(custom);
        assert_eq!(kept.id, "m1");
        assert_eq!(kept.attempt, 2);
        assert_eq!(kept.max_attempts, 7);
    }

    #[tokio::test]
    async fn enqueue_pushes_normalized_job() {
        let backend = Arc::new(MemoryQueue::new());
        let queue = producer(Arc::clone(&backend));
        let id = queue
            .enqueue(HandoffMessage::new("system.echo.v1"), EnqueueOptions::default())
            .await
            .unwrap();

        let job = backend.next().await.unwrap();
        assert_eq!(job.message.id, id);
        assert_eq!(job.message.attempt, 1);
    }

    #[tokio::test]
    async fn enqueue_and_wait_settles_from_correlator() {
        let backend = Arc::new(MemoryQueue::new());
        let queue = Arc::new(producer(Arc::clone(&backend)));

        let waiter = Arc::clone(&queue);
        let handle = tokio::spawn(async move {
            waiter
                .enqueue_and_wait(
                    HandoffMessage::new("system.echo.v1").with_id("m1"),
                    EnqueueOptions::default(),
                    WaitOptions::default(),
                )
                .await
        });

        let job = backend.next().await.unwrap();
        assert!(queue.pending().resolve(&job.message.id, ProcessResult::ok()));
        assert_eq!(handle.await.unwrap().unwrap(), ProcessResult::ok());
    }

    #[tokio::test]
    async fn failed_push_withdraws_waiter() {
        let backend = Arc::new(MemoryQueue::new());
        backend.close().await;
        let queue = producer(backend);

        let err = queue
            .enqueue_and_wait(
                HandoffMessage::new("system.echo.v1").with_id("m1"),
                EnqueueOptions::default(),
                WaitOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Queue(_)));
        assert!(!queue.pending().has("m1"));
    }
}
