//! Message dispatcher: validates, resolves and executes a message.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span};

use crate::error::{DispatchError, Result};
use crate::handoff::message::HandoffMessage;
use crate::handoff::pending::PendingResults;
use crate::handoff::processor::{EventEmitter, ProcessResult, ProcessorContext};
use crate::handoff::registry::ProcessorRegistry;
use crate::runtime::{ExecutionQueue, RunOptions, RunSource};

/// Check required envelope fields. The first missing one is reported.
pub fn validate(message: &HandoffMessage) -> std::result::Result<(), DispatchError> {
    let required: [(&'static str, &str); 6] = [
        ("id", message.id.as_str()),
        ("type", message.message_type.as_str()),
        ("tenantId", message.tenant_id.as_str()),
        ("sessionKey", message.session_key.as_str()),
        ("traceId", message.trace_id.as_str()),
        ("businessKey", message.business_key.as_str()),
    ];
    match required.into_iter().find(|(_, value)| value.trim().is_empty()) {
        Some((field, _)) => Err(DispatchError::MissingField { field }),
        None => Ok(()),
    }
}

/// Runs one message through its processor.
pub struct HandoffDispatcher {
    registry: Arc<ProcessorRegistry>,
    queue: Arc<ExecutionQueue>,
    pending: Arc<PendingResults>,
}

impl HandoffDispatcher {
    /// Create a dispatcher publishing interim events through `pending`.
    pub fn new(
        registry: Arc<ProcessorRegistry>,
        queue: Arc<ExecutionQueue>,
        pending: Arc<PendingResults>,
    ) -> Self {
        Self {
            registry,
            queue,
            pending,
        }
    }

    /// Validate, resolve and execute `message`, returning the processor's
    /// outcome unchanged.
    pub async fn dispatch(&self, message: &HandoffMessage) -> Result<ProcessResult> {
        validate(message)?;

        let resolved = self
            .registry
            .resolve(&message.message_type, message.organization_id.as_deref())
            .await?;
        let policy = resolved.metadata.policy;

        let run_id = if message.id.is_empty() {
            self.queue.generate_run_id()
        } else {
            message.id.clone()
        };
        let lane = message.requested_lane.unwrap_or(policy.lane);

        let mut options = RunOptions::new(run_id.clone())
            .with_session_key(message.session_key.clone())
            .with_lane(lane)
            .with_source(message.source.unwrap_or(RunSource::Handoff))
            .with_cancel(CancellationToken::new());
        options.timeout = policy.timeout;
        options.conversation_id = message.conversation_id.clone();
        options.execution_id = message.execution_id().map(str::to_string);
        options.integration_id = message.integration_id().map(str::to_string);
        options.user_id = message.user_id.clone();
        options.tenant_id = Some(message.tenant_id.clone());

        let emitter: EventEmitter = {
            let pending = Arc::clone(&self.pending);
            let message_id = message.id.clone();
            Arc::new(move |event| pending.publish(&message_id, event))
        };

        debug!(
            message_id = %message.id,
            message_type = %message.message_type,
            processor = %resolved.processor.name(),
            lane = %lane,
            attempt = message.attempt,
            "Dispatching message"
        );

        let processor = resolved.processor;
        let trace_id = message.trace_id.clone();
        let span = info_span!(
            "handoff",
            message_id = %message.id,
            message_type = %message.message_type,
            trace_id = %message.trace_id,
        );
        self.queue
            .run(options, |cancel| async move {
                let ctx = ProcessorContext::new(run_id, trace_id, cancel, emitter);
                processor.process(message, ctx).await
            })
            .instrument(span)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::config::LaneConfig;
    use crate::error::Error;
    use crate::handoff::pending::{WaitOptions, channel_callback};
    use crate::handoff::processor::{HandoffProcessor, ProcessorMetadata, ProcessorPolicy};
    use crate::runtime::{Lane, RunMetadata, RunRegistry};

    /// Records the run it executed under and emits two events.
    struct Recorder {
        queue: Arc<ExecutionQueue>,
        seen: Mutex<Option<RunMetadata>>,
    }

    #[async_trait]
    impl HandoffProcessor for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }
        fn metadata(&self) -> ProcessorMetadata {
            ProcessorMetadata::new(
                ["agent.chat.v1"],
                ProcessorPolicy::new(Lane::Subagent).with_timeout(Duration::from_secs(30)),
            )
        }
        async fn process(
            &self,
            _message: &HandoffMessage,
            ctx: ProcessorContext,
        ) -> Result<ProcessResult> {
            let run = self.queue.get_run(&ctx.run_id).await;
            *self.seen.lock().unwrap() = run;
            ctx.emit(json!({"progress": 1}));
            ctx.emit(json!({"progress": 2}));
            Ok(ProcessResult::ok_with_output(json!("done")))
        }
    }

    fn message() -> HandoffMessage {
        HandoffMessage::new("agent.chat.v1")
            .with_id("m1")
            .with_tenant("t1")
            .with_session_key("chat:conversation:c1")
            .with_trace_id("trace-1")
            .with_business_key("biz-1")
            .with_conversation("c1")
            .with_payload("integrationId", "int-1")
    }

    fn setup() -> (HandoffDispatcher, Arc<Recorder>, Arc<PendingResults>, Arc<ProcessorRegistry>) {
        let queue = Arc::new(ExecutionQueue::new(
            Arc::new(RunRegistry::new(Duration::from_secs(600))),
            LaneConfig::default(),
        ));
        let registry = Arc::new(ProcessorRegistry::new());
        let pending = Arc::new(PendingResults::new(Duration::from_secs(5)));
        let recorder = Arc::new(Recorder {
            queue: Arc::clone(&queue),
            seen: Mutex::new(None),
        });
        let dispatcher =
            HandoffDispatcher::new(Arc::clone(&registry), queue, Arc::clone(&pending));
        (dispatcher, recorder, pending, registry)
    }

    #[test]
    fn validation_order() {
        let cases: [(fn(&mut HandoffMessage), &str); 6] = [
            (|m| m.id.clear(), "id"),
            (|m| m.message_type.clear(), "type"),
            (|m| m.tenant_id.clear(), "tenantId"),
            (|m| m.session_key.clear(), "sessionKey"),
            (|m| m.trace_id.clear(), "traceId"),
            (|m| m.business_key.clear(), "businessKey"),
        ];
        for (strip, field) in cases {
            let mut m = message();
            strip(&mut m);
            let err = validate(&m).unwrap_err();
            assert_eq!(err.to_string(), format!("Invalid message: {field} is required"));
        }

        // Several missing: the first in order wins.
        let mut m = message();
        m.trace_id.clear();
        m.tenant_id.clear();
        assert!(validate(&m).unwrap_err().to_string().contains("tenantId"));
        assert!(validate(&message()).is_ok());
    }

    #[tokio::test]
    async fn missing_session_key_fails_before_resolution() {
        let (dispatcher, _, _, _) = setup();
        // No processor is registered: a resolution error would mention the type.
        let mut m = message();
        m.session_key.clear();
        let err = dispatcher.dispatch(&m).await.unwrap_err();
        assert!(err.is_permanent());
        assert_eq!(err.to_string(), "Invalid message: sessionKey is required");
    }

    #[tokio::test]
    async fn unknown_type_is_permanent() {
        let (dispatcher, _, _, _) = setup();
        let err = dispatcher
            .dispatch(&message().with_organization("org-9"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Dispatch(DispatchError::NoHandler { .. })));
        assert!(err.is_permanent());
        assert!(err.to_string().contains("org-9"));
    }

    #[tokio::test]
    async fn executes_under_run_with_policy_and_correlation() {
        let (dispatcher, recorder, pending, registry) = setup();
        registry.register(recorder.clone()).await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let wait = pending
            .wait_for("m1", WaitOptions::default().with_on_event(channel_callback(tx)))
            .unwrap();

        let outcome = dispatcher.dispatch(&message()).await.unwrap();
        assert_eq!(outcome, ProcessResult::ok_with_output(json!("done")));

        let run = recorder.seen.lock().unwrap().clone().unwrap();
        assert_eq!(run.run_id, "m1");
        assert_eq!(run.session_key, "chat:conversation:c1");
        assert_eq!(run.lane, Lane::Subagent);
        assert_eq!(run.source, RunSource::Handoff);
        assert_eq!(run.conversation_id.as_deref(), Some("c1"));
        assert_eq!(run.integration_id.as_deref(), Some("int-1"));
        assert_eq!(run.tenant_id.as_deref(), Some("t1"));

        assert_eq!(rx.recv().await.unwrap(), json!({"progress": 1}));
        assert_eq!(rx.recv().await.unwrap(), json!({"progress": 2}));

        // The dispatcher does not settle; that is the consumer's job.
        assert!(pending.has("m1"));
        pending.resolve("m1", outcome);
        wait.await.unwrap();
    }

    #[tokio::test]
    async fn requested_lane_overrides_policy() {
        let (dispatcher, recorder, _, registry) = setup();
        registry.register(recorder.clone()).await;

        dispatcher
            .dispatch(&message().with_lane(Lane::Cron))
            .await
            .unwrap();
        let run = recorder.seen.lock().unwrap().clone().unwrap();
        assert_eq!(run.lane, Lane::Cron);
    }
}
