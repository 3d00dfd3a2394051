//! Wires the handoff components together.

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::HandoffConfig;
use crate::handoff::backend::QueueBackend;
use crate::handoff::consumer::HandoffConsumer;
use crate::handoff::dispatcher::HandoffDispatcher;
use crate::handoff::local_task::{LocalTaskBridge, LocalTaskProcessor, LocalTasks};
use crate::handoff::pending::PendingResults;
use crate::handoff::processor::ProcessorPolicy;
use crate::handoff::producer::HandoffQueue;
use crate::handoff::registry::ProcessorRegistry;
use crate::runtime::{DisconnectGuard, ExecutionQueue, Lane, RunRegistry, spawn_sweep_task};

/// A fully wired handoff runtime over one queue backend.
pub struct HandoffSystem {
    config: HandoffConfig,
    backend: Arc<dyn QueueBackend>,
    runs: Arc<RunRegistry>,
    execution: Arc<ExecutionQueue>,
    processors: Arc<ProcessorRegistry>,
    pending: Arc<PendingResults>,
    dispatcher: Arc<HandoffDispatcher>,
    producer: Arc<HandoffQueue>,
    consumer: Arc<HandoffConsumer>,
    local_tasks: LocalTaskBridge,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl HandoffSystem {
    /// Build every component and register the local-task processor.
    /// Nothing runs until [`HandoffSystem::start`].
    pub async fn new(config: HandoffConfig, backend: Arc<dyn QueueBackend>) -> Self {
        let runs = Arc::new(RunRegistry::new(config.run_ttl));
        let execution = Arc::new(ExecutionQueue::new(Arc::clone(&runs), config.lanes));
        let processors = Arc::new(ProcessorRegistry::new());
        let pending = Arc::new(PendingResults::new(config.pending_timeout));

        let dispatcher = Arc::new(HandoffDispatcher::new(
            Arc::clone(&processors),
            Arc::clone(&execution),
            Arc::clone(&pending),
        ));
        let producer = Arc::new(HandoffQueue::new(
            Arc::clone(&backend),
            Arc::clone(&pending),
            config.max_attempts,
        ));
        let consumer = Arc::new(HandoffConsumer::new(
            &config,
            Arc::clone(&backend),
            Arc::clone(&producer),
            Arc::clone(&dispatcher),
            Arc::clone(&pending),
        ));

        let tasks = Arc::new(LocalTasks::new());
        processors
            .register(Arc::new(LocalTaskProcessor::new(
                Arc::clone(&tasks),
                ProcessorPolicy::new(Lane::Main),
            )))
            .await;
        let local_tasks = LocalTaskBridge::new(tasks, Arc::clone(&producer));

        Self {
            config,
            backend,
            runs,
            execution,
            processors,
            pending,
            dispatcher,
            producer,
            consumer,
            local_tasks,
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the run sweep and the consumer loop. Calling twice is a no-op.
    pub fn start(&self) {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        if !handles.is_empty() {
            warn!("Handoff system already started");
            return;
        }
        handles.push(spawn_sweep_task(
            Arc::clone(&self.runs),
            self.config.sweep_interval(),
        ));
        handles.push(Arc::clone(&self.consumer).spawn(self.shutdown.child_token()));
        info!(
            worker_concurrency = self.config.worker_concurrency,
            sweep_interval = ?self.config.sweep_interval(),
            "Handoff system started"
        );
    }

    /// Stop consuming, reject every waiter and cancel every active run.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.backend.close().await;

        let rejected = self.pending.clear_all("Handoff system shutting down");
        self.execution.shutdown().await;

        let handles: Vec<JoinHandle<()>> = self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }
        info!(rejected_waiters = rejected, "Handoff system stopped");
    }

    /// A disconnect guard for a run, using the configured grace period.
    pub fn disconnect_guard(
        &self,
        run_id: impl Into<String>,
        cancel: CancellationToken,
    ) -> DisconnectGuard {
        DisconnectGuard::new(run_id, cancel, self.config.client_disconnect_grace)
    }

    /// Configuration the system was built with.
    pub fn config(&self) -> &HandoffConfig {
        &self.config
    }

    /// Registry of active runs.
    pub fn runs(&self) -> &Arc<RunRegistry> {
        &self.runs
    }

    /// Execution queue for cancellation and lane stats.
    pub fn execution(&self) -> &Arc<ExecutionQueue> {
        &self.execution
    }

    /// Processor registry. Register handlers here before [`HandoffSystem::start`].
    pub fn processors(&self) -> &Arc<ProcessorRegistry> {
        &self.processors
    }

    /// Correlator of waiting callers.
    pub fn pending(&self) -> &Arc<PendingResults> {
        &self.pending
    }

    /// Dispatcher shared with the consumer.
    pub fn dispatcher(&self) -> &Arc<HandoffDispatcher> {
        &self.dispatcher
    }

    /// Producer for enqueueing messages.
    pub fn producer(&self) -> &Arc<HandoffQueue> {
        &self.producer
    }

    /// Consumer, e.g. to subscribe to dead letters.
    pub fn consumer(&self) -> &Arc<HandoffConsumer> {
        &self.consumer
    }

    /// Bridge for running closures through the queue.
    pub fn local_tasks(&self) -> &LocalTaskBridge {
        &self.local_tasks
    }
}
