//! Execution queue: runs a task under run registration, timeout-driven
//! cancellation and guaranteed cleanup.
//!
//! This is a thin wrapper: there is no admission control or backpressure.
//! Lanes are descriptive tags; configured lane capacities are reported by
//! [`ExecutionQueue::all_lane_stats`] but never enforced.

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::LaneConfig;
use crate::error::{Result, RunError};
use crate::runtime::registry::RunRegistry;
use crate::runtime::types::{Lane, LaneStats, RunMetadata, RunOptions, RunSource};

/// Aborts the timeout timer and unregisters the run when dropped, so cleanup
/// also happens if the caller's future is dropped mid-run.
struct RunGuard {
    registry: Arc<RunRegistry>,
    run_id: Option<String>,
    timer: Option<JoinHandle<()>>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        let Some(run_id) = self.run_id.take() else {
            return;
        };
        let registry = Arc::clone(&self.registry);
        // Drop cannot await; the removal is a short write-lock section.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    registry.complete_run(&run_id).await;
                });
            }
            Err(_) => debug!(run_id = %run_id, "No runtime to unregister run"),
        }
    }
}

/// Runs units of work and exposes cancellation and lane occupancy.
pub struct ExecutionQueue {
    registry: Arc<RunRegistry>,
    lanes: LaneConfig,
}

impl ExecutionQueue {
    /// Create a queue over `registry`, reporting `lanes` as lane capacities.
    pub fn new(registry: Arc<RunRegistry>, lanes: LaneConfig) -> Self {
        Self { registry, lanes }
    }

    /// Execute `task` as a registered run.
    ///
    /// Fails with [`RunError::AbortedBeforeStart`] if `options.cancel` is
    /// already cancelled. With a timeout set, the token is cancelled once it
    /// elapses; the task must observe the token to actually stop.
    pub async fn run<T, F, Fut>(&self, options: RunOptions, task: F) -> Result<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if options.cancel.is_cancelled() {
            return Err(RunError::AbortedBeforeStart {
                run_id: options.run_id,
            }
            .into());
        }

        let metadata = self.registry.register_run(&options).await;
        let mut guard = RunGuard {
            registry: Arc::clone(&self.registry),
            run_id: Some(metadata.run_id.clone()),
            timer: None,
        };

        if let Some(timeout) = options.timeout {
            let token = options.cancel.clone();
            let run_id = metadata.run_id.clone();
            guard.timer = Some(tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        debug!(run_id = %run_id, ?timeout, "Run timed out, cancelling");
                        token.cancel();
                    }
                    _ = token.cancelled() => {}
                }
            }));
        }

        let result = task(options.cancel.clone()).await;

        if let Some(timer) = guard.timer.take() {
            timer.abort();
        }
        if let Some(run_id) = guard.run_id.take() {
            self.registry.complete_run(&run_id).await;
        }

        result
    }

    /// Generate a fresh run id.
    pub fn generate_run_id(&self) -> String {
        self.registry.generate_run_id()
    }

    /// The underlying run registry.
    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    /// Cancel one run. Returns false if it is not registered.
    pub async fn abort_by_run_id(&self, run_id: &str, reason: Option<&str>) -> bool {
        self.registry.abort_by_run_id(run_id, reason).await
    }

    /// Cancel every run under a session key. Returns the aborted run ids.
    pub async fn abort_by_session_key(&self, session_key: &str, reason: Option<&str>) -> Vec<String> {
        self.registry.abort_by_session_key(session_key, reason).await
    }

    /// Cancel every run bound to a conversation. Returns the aborted run ids.
    pub async fn abort_by_conversation(
        &self,
        conversation_id: &str,
        reason: Option<&str>,
    ) -> Vec<String> {
        self.registry
            .abort_by_conversation(conversation_id, reason)
            .await
    }

    /// Cancel every run bound to an integration. Returns the aborted run ids.
    pub async fn abort_by_integration(
        &self,
        integration_id: &str,
        reason: Option<&str>,
    ) -> Vec<String> {
        self.registry.abort_by_integration(integration_id, reason).await
    }

    /// Look up an active run.
    pub async fn get_run(&self, run_id: &str) -> Option<RunMetadata> {
        self.registry.get_run(run_id).await
    }

    /// Active runs under a session key.
    pub async fn get_runs_by_session(&self, session_key: &str) -> Vec<RunMetadata> {
        self.registry.get_runs_by_session(session_key).await
    }

    /// Active runs bound to a conversation.
    pub async fn get_runs_by_conversation(&self, conversation_id: &str) -> Vec<RunMetadata> {
        self.registry.get_runs_by_conversation(conversation_id).await
    }

    /// Number of active runs.
    pub async fn get_run_count(&self) -> usize {
        self.registry.get_run_count().await
    }

    /// Number of active runs tagged with `lane`.
    pub async fn get_run_count_by_lane(&self, lane: Lane) -> usize {
        self.registry.get_run_count_by_lane(lane).await
    }

    /// Number of active runs started from `source`.
    pub async fn get_run_count_by_source(&self, source: RunSource) -> usize {
        self.registry.get_run_count_by_source(source).await
    }

    /// Configured (reporting-only) capacity of a lane.
    pub fn lane_capacity(&self, lane: Lane) -> usize {
        match lane {
            Lane::Main => self.lanes.main,
            Lane::Subagent => self.lanes.subagent,
            Lane::Cron => self.lanes.cron,
            Lane::Nested => self.lanes.nested,
        }
    }

    /// Active runs and configured capacity for one lane.
    pub async fn lane_stats(&self, lane: Lane) -> LaneStats {
        LaneStats {
            lane,
            active: self.registry.get_run_count_by_lane(lane).await,
            max_concurrent: self.lane_capacity(lane),
        }
    }

    /// Lane stats for every lane, in [`Lane::ALL`] order.
    pub async fn all_lane_stats(&self) -> Vec<LaneStats> {
        let mut stats = Vec::with_capacity(Lane::ALL.len());
        for lane in Lane::ALL {
            stats.push(self.lane_stats(lane).await);
        }
        stats
    }

    /// Cancel every active run.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }
}
