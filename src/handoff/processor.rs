//! Processor abstraction: handlers for handoff message types.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::handoff::message::HandoffMessage;
use crate::runtime::Lane;

/// Terminal outcome of one processor invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ProcessResult {
    /// Success. Outbound messages are enqueued by the consumer.
    Ok {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        outbound: Vec<HandoffMessage>,
        /// Value handed back to a waiting caller, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
    },
    /// Transient failure; redelivered while attempts remain.
    Retry {
        #[serde(rename = "delayMs", default)]
        delay_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Permanent failure; dead-lettered without retry.
    Dead { reason: String },
}

impl ProcessResult {
    /// Success with no output.
    pub fn ok() -> Self {
        Self::Ok {
            outbound: Vec::new(),
            output: None,
        }
    }

    /// Success carrying `output` back to the waiter.
    pub fn ok_with_output(output: Value) -> Self {
        Self::Ok {
            outbound: Vec::new(),
            output: Some(output),
        }
    }

    /// Success that enqueues `outbound` messages.
    pub fn ok_with_outbound(outbound: Vec<HandoffMessage>) -> Self {
        Self::Ok {
            outbound,
            output: None,
        }
    }

    /// Ask for redelivery after `delay`.
    pub fn retry(delay: Duration, reason: Option<String>) -> Self {
        Self::Retry {
            delay_ms: delay.as_millis() as u64,
            reason,
        }
    }

    /// Terminal failure. Never retried.
    pub fn dead(reason: impl Into<String>) -> Self {
        Self::Dead {
            reason: reason.into(),
        }
    }

    /// Wire name of the outcome.
    pub fn status(&self) -> &'static str {
        match self {
            Self::Ok { .. } => "ok",
            Self::Retry { .. } => "retry",
            Self::Dead { .. } => "dead",
        }
    }
}

/// Execution policy declared by a processor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorPolicy {
    pub lane: Lane,
    pub timeout: Option<Duration>,
}

impl ProcessorPolicy {
    /// Policy running on `lane` with no timeout.
    pub fn new(lane: Lane) -> Self {
        Self {
            lane,
            timeout: None,
        }
    }

    /// Cancel runs of this processor after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Message types a processor handles and how they run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorMetadata {
    pub types: Vec<String>,
    pub policy: ProcessorPolicy,
}

impl ProcessorMetadata {
    /// Metadata handling `types` under `policy`.
    pub fn new<I, S>(types: I, policy: ProcessorPolicy) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            types: types.into_iter().map(Into::into).collect(),
            policy,
        }
    }
}

/// Forwards an interim event to whoever waits on the message.
/// Returns whether a local waiter received it.
pub type EventEmitter = Arc<dyn Fn(Value) -> bool + Send + Sync>;

/// Per-invocation context handed to a processor.
#[derive(Clone)]
pub struct ProcessorContext {
    pub run_id: String,
    pub trace_id: String,
    pub cancel: CancellationToken,
    emitter: EventEmitter,
}

impl ProcessorContext {
    /// Context for one run.
    pub fn new(
        run_id: impl Into<String>,
        trace_id: impl Into<String>,
        cancel: CancellationToken,
        emitter: EventEmitter,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            trace_id: trace_id.into(),
            cancel,
            emitter,
        }
    }

    /// Publish an interim event. Only same-process waiters receive it.
    pub fn emit(&self, event: Value) -> bool {
        (self.emitter)(event)
    }

    /// Clone of the event emitter, for handing to spawned work.
    pub fn emitter(&self) -> EventEmitter {
        Arc::clone(&self.emitter)
    }

    /// Whether the run has been asked to stop.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl fmt::Debug for ProcessorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorContext")
            .field("run_id", &self.run_id)
            .field("trace_id", &self.trace_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// A handler for one or more handoff message types.
///
/// Delivery is at-least-once: `process` may run more than once for the same
/// message id and must tolerate it.
#[async_trait]
pub trait HandoffProcessor: Send + Sync {
    /// Name used in logs and conflict reports.
    fn name(&self) -> &str;

    /// Types handled and execution policy.
    fn metadata(&self) -> ProcessorMetadata;

    async fn process(&self, message: &HandoffMessage, ctx: ProcessorContext)
    -> Result<ProcessResult>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outcome_wire_format() {
        let retry = ProcessResult::retry(Duration::from_millis(250), Some("busy".into()));
        assert_eq!(
            serde_json::to_value(&retry).unwrap(),
            json!({"status": "retry", "delayMs": 250, "reason": "busy"})
        );

        let dead: ProcessResult =
            serde_json::from_value(json!({"status": "dead", "reason": "bad input"})).unwrap();
        assert_eq!(dead, ProcessResult::dead("bad input"));

        let ok: ProcessResult = serde_json::from_value(json!({"status": "ok"})).unwrap();
        assert_eq!(ok, ProcessResult::ok());
        assert_eq!(ok.status(), "ok");
    }

    #[test]
    fn context_emit_forwards() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let ctx = ProcessorContext::new(
            "r1",
            "t1",
            CancellationToken::new(),
            Arc::new(move |event| {
                sink.lock().unwrap().push(event);
                true
            }),
        );
        assert!(ctx.emit(json!({"step": 1})));
        assert!(ctx.emit(json!({"step": 2})));
        assert_eq!(*seen.lock().unwrap(), vec![json!({"step": 1}), json!({"step": 2})]);
    }
}
