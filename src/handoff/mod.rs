//! Message handoff: envelope, processors, transport and correlation.

pub mod backend;
pub mod consumer;
pub mod dispatcher;
pub mod local_task;
pub mod message;
pub mod message_type;
pub mod pending;
pub mod processor;
pub mod producer;
pub mod registry;
pub mod system;

pub use backend::{EnqueueOptions, MemoryQueue, QueueBackend, QueueJob};
pub use consumer::{DeadLetter, HandoffConsumer, JobDisposition};
pub use dispatcher::HandoffDispatcher;
pub use local_task::{
    CallerContext, LOCAL_TASK_MESSAGE_TYPE, LocalTaskBridge, LocalTaskContext, LocalTaskProcessor,
    LocalTaskRequest, LocalTasks,
};
pub use message::HandoffMessage;
pub use pending::{EventCallback, PendingResults, PendingWait, WaitOptions, channel_callback};
pub use processor::{
    HandoffProcessor, ProcessResult, ProcessorContext, ProcessorMetadata, ProcessorPolicy,
};
pub use producer::HandoffQueue;
pub use registry::{GLOBAL_ORGANIZATION_SCOPE, PluginEvent, ProcessorRegistry, spawn_plugin_listener};
pub use system::HandoffSystem;
