//! Local-task bridge.
//!
//! Runs an in-process closure through the durable-queue protocol so it gets
//! the same lane, timeout and cancellation treatment as any other message.
//! The closure stays in a process-local table; only its id and a snapshot of
//! the caller's identity travel in the envelope.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{LocalTaskError, Result};
use crate::handoff::backend::EnqueueOptions;
use crate::handoff::message::HandoffMessage;
use crate::handoff::pending::WaitOptions;
use crate::handoff::processor::{
    EventEmitter, HandoffProcessor, ProcessResult, ProcessorContext, ProcessorMetadata,
    ProcessorPolicy,
};
use crate::handoff::producer::HandoffQueue;
use crate::runtime::{Lane, RunSource};

/// Reserved message type for local tasks.
pub const LOCAL_TASK_MESSAGE_TYPE: &str = "system.local_task.v1";

const TASK_ID_KEY: &str = "taskId";
const CALLER_KEY: &str = "caller";

/// Identity of whoever submitted a local task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CallerContext {
    pub tenant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl CallerContext {
    /// Caller within `tenant_id` with no further identity.
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            ..Default::default()
        }
    }

    pub fn with_organization(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

/// What a local task closure receives.
#[derive(Clone)]
pub struct LocalTaskContext {
    pub run_id: String,
    pub cancel: CancellationToken,
    pub caller: CallerContext,
    emitter: EventEmitter,
}

impl LocalTaskContext {
    /// Forward an interim event to the submitter.
    pub fn emit(&self, event: Value) -> bool {
        (self.emitter)(event)
    }
}

impl fmt::Debug for LocalTaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTaskContext")
            .field("run_id", &self.run_id)
            .field("caller", &self.caller)
            .finish()
    }
}

type TaskFuture = BoxFuture<'static, anyhow::Result<Value>>;
type TaskFn = Box<dyn FnOnce(LocalTaskContext) -> TaskFuture + Send>;

fn boxed_task<F, Fut>(task: F) -> TaskFn
where
    F: FnOnce(LocalTaskContext) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Box::new(move |ctx| -> TaskFuture { task(ctx).boxed() })
}

/// Process-local table of submitted closures. Each id is taken at most once.
#[derive(Default)]
pub struct LocalTasks {
    tasks: Mutex<HashMap<String, TaskFn>>,
}

impl LocalTasks {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, id: String, task: TaskFn) {
        self.lock().insert(id, task);
    }

    fn take(&self, id: &str) -> Option<TaskFn> {
        self.lock().remove(id)
    }

    /// Whether task `id` is still waiting to run.
    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Number of tasks waiting to run.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no task is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, TaskFn>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Routing and wait options for one submission.
#[derive(Debug, Clone, Default)]
pub struct LocalTaskRequest {
    pub session_key: String,
    pub caller: CallerContext,
    pub lane: Option<Lane>,
    pub conversation_id: Option<String>,
    /// Trace id to propagate; a fresh one is generated when unset.
    pub trace_id: Option<String>,
    pub wait: WaitOptions,
}

impl LocalTaskRequest {
    /// Request under `session_key` on behalf of `caller`.
    pub fn new(session_key: impl Into<String>, caller: CallerContext) -> Self {
        Self {
            session_key: session_key.into(),
            caller,
            ..Default::default()
        }
    }

    pub fn with_lane(mut self, lane: Lane) -> Self {
        self.lane = Some(lane);
        self
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_wait(mut self, wait: WaitOptions) -> Self {
        self.wait = wait;
        self
    }
}

/// Submits closures as local-task messages and waits for them.
pub struct LocalTaskBridge {
    tasks: Arc<LocalTasks>,
    producer: Arc<HandoffQueue>,
}

impl LocalTaskBridge {
    /// Bridge storing closures in `tasks` and enqueueing through `producer`.
    pub fn new(tasks: Arc<LocalTasks>, producer: Arc<HandoffQueue>) -> Self {
        Self { tasks, producer }
    }

    /// Run `task` through the queue and return its output.
    pub async fn submit<F, Fut>(&self, request: LocalTaskRequest, task: F) -> Result<Value>
    where
        F: FnOnce(LocalTaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let task_id = Uuid::new_v4().to_string();
        let caller = serde_json::to_value(&request.caller).map_err(anyhow::Error::from)?;

        let mut message = HandoffMessage::new(LOCAL_TASK_MESSAGE_TYPE)
            .with_id(task_id.clone())
            .with_tenant(request.caller.tenant_id.clone())
            .with_session_key(request.session_key)
            .with_business_key(format!("local_task:{task_id}"))
            .with_trace_id(
                request
                    .trace_id
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
            )
            .with_source(RunSource::Local)
            .with_payload(TASK_ID_KEY, task_id.clone())
            .with_payload(CALLER_KEY, caller);
        message.organization_id = request.caller.organization_id.clone();
        message.user_id = request.caller.user_id.clone();
        message.conversation_id = request.conversation_id;
        message.requested_lane = request.lane;

        self.tasks.insert(task_id.clone(), boxed_task(task));
        debug!(task_id = %task_id, "Submitting local task");

        let outcome = self
            .producer
            .enqueue_and_wait(message, EnqueueOptions::default(), request.wait)
            .await;
        // Timeouts and enqueue failures leave the closure behind.
        if self.tasks.take(&task_id).is_some() {
            debug!(task_id = %task_id, "Discarded unexecuted local task");
        }

        match outcome? {
            ProcessResult::Ok { output, .. } => Ok(output.unwrap_or(Value::Null)),
            ProcessResult::Dead { reason } => Err(LocalTaskError::Failed {
                id: task_id,
                reason,
            }
            .into()),
            ProcessResult::Retry { reason, .. } => Err(LocalTaskError::Failed {
                id: task_id,
                reason: reason.unwrap_or_else(|| "settled with a retry outcome".to_string()),
            }
            .into()),
        }
    }
}

/// Processor executing closures from the local task table.
pub struct LocalTaskProcessor {
    tasks: Arc<LocalTasks>,
    policy: ProcessorPolicy,
}

impl LocalTaskProcessor {
    /// Processor taking closures from `tasks`, run under `policy`.
    pub fn new(tasks: Arc<LocalTasks>, policy: ProcessorPolicy) -> Self {
        Self { tasks, policy }
    }
}

#[async_trait]
impl HandoffProcessor for LocalTaskProcessor {
    fn name(&self) -> &str {
        "local-task"
    }

    fn metadata(&self) -> ProcessorMetadata {
        ProcessorMetadata::new([LOCAL_TASK_MESSAGE_TYPE], self.policy)
    }

    async fn process(&self, message: &HandoffMessage, ctx: ProcessorContext) -> Result<ProcessResult> {
        let Some(task_id) = message.payload.get(TASK_ID_KEY).and_then(Value::as_str) else {
            return Ok(ProcessResult::dead("Invalid message: taskId is required"));
        };
        let Some(task) = self.tasks.take(task_id) else {
            return Ok(ProcessResult::dead(
                LocalTaskError::NotFound {
                    id: task_id.to_string(),
                }
                .to_string(),
            ));
        };

        let caller = message
            .payload
            .get(CALLER_KEY)
            .cloned()
            .map(serde_json::from_value::<CallerContext>)
            .transpose()
            .unwrap_or_else(|e| {
                warn!(task_id = %task_id, error = %e, "Unreadable caller context");
                None
            })
            .unwrap_or_else(|| CallerContext::new(message.tenant_id.clone()));

        let task_ctx = LocalTaskContext {
            run_id: ctx.run_id.clone(),
            cancel: ctx.cancel.clone(),
            caller,
            emitter: ctx.emitter(),
        };

        match task(task_ctx).await {
            Ok(output) => Ok(ProcessResult::ok_with_output(output)),
            Err(e) => {
                warn!(task_id = %task_id, error = %format!("{e:#}"), "Local task failed");
                Ok(ProcessResult::dead(format!("{e:#}")))
            }
        }
    }
}
