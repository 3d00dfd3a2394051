//! Consumer side of the durable queue.
//!
//! Pulls jobs from the backend, dispatches them, and turns each outcome into
//! completion, a delayed requeue, or a dead letter. Waiters registered in the
//! correlator are settled exactly when the message reaches a terminal state.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::HandoffConfig;
use crate::error::Error;
use crate::handoff::backend::{EnqueueOptions, QueueBackend, QueueJob};
use crate::handoff::dispatcher::HandoffDispatcher;
use crate::handoff::message::HandoffMessage;
use crate::handoff::pending::PendingResults;
use crate::handoff::processor::ProcessResult;
use crate::handoff::producer::HandoffQueue;

const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(60);
const DEAD_LETTER_CAPACITY: usize = 256;

/// Terminal failure record, logged and broadcast for external persistence.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub message_id: String,
    pub message_type: String,
    pub trace_id: String,
    pub reason: String,
    pub attempt: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

/// What the consumer did with one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobDisposition {
    Completed,
    Requeued { attempt: u32, delay: Duration },
    DeadLettered { reason: String },
}

pub struct HandoffConsumer {
    backend: Arc<dyn QueueBackend>,
    producer: Arc<HandoffQueue>,
    dispatcher: Arc<HandoffDispatcher>,
    pending: Arc<PendingResults>,
    concurrency: usize,
    default_max_attempts: u32,
    retry_backoff: Duration,
    dead_letters: broadcast::Sender<DeadLetter>,
}

impl HandoffConsumer {
    /// Create a consumer. Concurrency, attempts and backoff come from `config`.
    pub fn new(
        config: &HandoffConfig,
        backend: Arc<dyn QueueBackend>,
        producer: Arc<HandoffQueue>,
        dispatcher: Arc<HandoffDispatcher>,
        pending: Arc<PendingResults>,
    ) -> Self {
        let (dead_letters, _) = broadcast::channel(DEAD_LETTER_CAPACITY);
        Self {
            backend,
            producer,
            dispatcher,
            pending,
            concurrency: config.worker_concurrency.max(1),
            default_max_attempts: config.max_attempts,
            retry_backoff: config.retry_backoff,
            dead_letters,
        }
    }

    /// Observe dead letters as they happen.
    pub fn subscribe_dead_letters(&self) -> broadcast::Receiver<DeadLetter> {
        self.dead_letters.subscribe()
    }

    /// Dispatch one job and act on its outcome.
    ///
    /// A panicking processor is treated like a transient processor error.
    pub async fn handle_job(&self, job: QueueJob) -> JobDisposition {
        let dispatched = AssertUnwindSafe(self.dispatcher.dispatch(&job.message))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(panic_error(panic.as_ref())));
        let disposition = match dispatched {
            Ok(result) => self.handle_result(&job, result).await,
            Err(e) => self.handle_error(&job, e).await,
        };
        debug!(
            message_id = %job.message.id,
            message_type = %job.message.message_type,
            disposition = ?disposition,
            "Job handled"
        );
        disposition
    }

    async fn handle_result(&self, job: &QueueJob, result: ProcessResult) -> JobDisposition {
        let message = &job.message;
        match result {
            ProcessResult::Ok { outbound, output } => {
                for next in &outbound {
                    if let Err(e) = self
                        .producer
                        .enqueue(next.clone(), EnqueueOptions::default())
                        .await
                    {
                        warn!(
                            message_id = %message.id,
                            outbound_type = %next.message_type,
                            error = %e,
                            "Failed to enqueue outbound message"
                        );
                    }
                }
                if let Err(e) = self.backend.complete(job).await {
                    warn!(message_id = %message.id, error = %e, "Failed to acknowledge job");
                }
                self.pending
                    .resolve(&message.id, ProcessResult::Ok { outbound, output });
                JobDisposition::Completed
            }
            ProcessResult::Retry { delay_ms, reason } => {
                let max_attempts = self.max_attempts(message);
                let next_attempt = message.attempt.max(1) + 1;
                if next_attempt > max_attempts {
                    let reason = reason
                        .unwrap_or_else(|| format!("Retry exhausted after {max_attempts} attempts"));
                    self.dead_letter(job, &reason).await;
                    self.pending
                        .resolve(&message.id, ProcessResult::dead(reason.clone()));
                    return JobDisposition::DeadLettered { reason };
                }

                let delay = Duration::from_millis(delay_ms);
                match self.requeue(job, delay).await {
                    Ok(attempt) => JobDisposition::Requeued { attempt, delay },
                    Err(e) => {
                        let reason = format!("Requeue failed: {e}");
                        self.dead_letter(job, &reason).await;
                        self.pending.reject(&message.id, e);
                        JobDisposition::DeadLettered { reason }
                    }
                }
            }
            ProcessResult::Dead { reason } => {
                self.dead_letter(job, &reason).await;
                self.pending
                    .resolve(&message.id, ProcessResult::dead(reason.clone()));
                JobDisposition::DeadLettered { reason }
            }
        }
    }

    async fn handle_error(&self, job: &QueueJob, e: Error) -> JobDisposition {
        let message = &job.message;
        let reason = e.to_string();

        if e.is_permanent() {
            self.dead_letter(job, &reason).await;
            self.pending.reject(&message.id, e);
            return JobDisposition::DeadLettered { reason };
        }

        let max_attempts = self.max_attempts(message);
        if message.attempt.max(1) + 1 > max_attempts {
            self.dead_letter(job, &reason).await;
            self.pending.reject(&message.id, e);
            return JobDisposition::DeadLettered { reason };
        }

        let delay = self.backoff(message.attempt.max(1));
        warn!(
            message_id = %message.id,
            attempt = message.attempt,
            ?delay,
            error = %reason,
            "Transient processor error, requeueing"
        );
        match self.requeue(job, delay).await {
            Ok(attempt) => JobDisposition::Requeued { attempt, delay },
            Err(requeue_err) => {
                let reason = format!("Requeue failed: {requeue_err}");
                self.dead_letter(job, &reason).await;
                self.pending.reject(&message.id, e);
                JobDisposition::DeadLettered { reason }
            }
        }
    }

    fn max_attempts(&self, message: &HandoffMessage) -> u32 {
        if message.max_attempts == 0 {
            self.default_max_attempts
        } else {
            message.max_attempts
        }
    }

    /// Exponential backoff for a failed attempt, capped, with up to 10% jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .retry_backoff
            .saturating_mul(1u32 << exp)
            .min(MAX_RETRY_BACKOFF);
        let jitter_ms = (base.as_millis() / 10) as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        base + Duration::from_millis(jitter)
    }

    async fn requeue(&self, job: &QueueJob, delay: Duration) -> crate::error::Result<u32> {
        let next = job.message.next_attempt();
        let attempt = next.attempt;
        let options = EnqueueOptions {
            delay: Some(delay),
            ..job.options
        };
        self.backend.push(QueueJob::new(next, options)).await?;
        if let Err(e) = self.backend.complete(job).await {
            warn!(message_id = %job.message.id, error = %e, "Failed to acknowledge requeued job");
        }
        debug!(message_id = %job.message.id, attempt, ?delay, "Requeued message");
        Ok(attempt)
    }

    async fn dead_letter(&self, job: &QueueJob, reason: &str) {
        let message = &job.message;
        error!(
            message_id = %message.id,
            message_type = %message.message_type,
            trace_id = %message.trace_id,
            attempt = message.attempt,
            reason = %reason,
            "Message dead-lettered"
        );
        if let Err(e) = self.backend.fail(job, reason).await {
            warn!(message_id = %message.id, error = %e, "Failed to record failed job");
        }
        // No subscribers is fine; the log line is the record.
        let _ = self.dead_letters.send(DeadLetter {
            message_id: message.id.clone(),
            message_type: message.message_type.clone(),
            trace_id: message.trace_id.clone(),
            reason: reason.to_string(),
            attempt: message.attempt,
            dead_lettered_at: Utc::now(),
        });
    }

    /// Spawn the consume loop. At most `worker_concurrency` jobs run at once.
    /// The loop ends when `shutdown` fires or the backend closes.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let permits = Arc::new(Semaphore::new(self.concurrency));
            info!(concurrency = self.concurrency, "Handoff consumer started");

            loop {
                let permit = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    permit = Arc::clone(&permits).acquire_owned() => match permit {
                        Ok(p) => p,
                        Err(_) => break,
                    },
                };
                let job = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    job = self.backend.next() => match job {
                        Some(job) => job,
                        None => break,
                    },
                };

                let consumer = Arc::clone(&self);
                tokio::spawn(async move {
                    let _permit = permit;
                    consumer.handle_job(job).await;
                });
            }

            info!("Handoff consumer stopped");
        })
    }
}

fn panic_error(panic: &(dyn Any + Send)) -> Error {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    anyhow::anyhow!("processor panicked: {detail}").into()
}
