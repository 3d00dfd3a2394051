//! Run registry: tracks in-flight runs and their cancellation handles.
//!
//! No lane or session gating happens here. Runs are indexed by id and by
//! session key; conversation and integration lookups scan the primary map.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::runtime::types::{Lane, RunMetadata, RunOptions, RunSource};

#[derive(Default)]
struct RegistryInner {
    runs: HashMap<String, RunMetadata>,
    by_session: HashMap<String, HashSet<String>>,
}

impl RegistryInner {
    fn remove(&mut self, run_id: &str) -> Option<RunMetadata> {
        let meta = self.runs.remove(run_id)?;
        if let Some(bucket) = self.by_session.get_mut(&meta.session_key) {
            bucket.remove(run_id);
            if bucket.is_empty() {
                self.by_session.remove(&meta.session_key);
            }
        }
        Some(meta)
    }
}

/// Registry of active runs.
pub struct RunRegistry {
    inner: RwLock<RegistryInner>,
    run_ttl: Duration,
}

impl RunRegistry {
    /// Create a registry whose runs expire after `run_ttl` unless registered
    /// with an explicit timeout.
    pub fn new(run_ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            run_ttl,
        }
    }

    /// Generate a fresh run id.
    pub fn generate_run_id(&self) -> String {
        Uuid::new_v4().to_string()
    }

    /// Register a run and index it by session key.
    pub async fn register_run(&self, options: &RunOptions) -> RunMetadata {
        let now = Utc::now();
        let ttl = options.timeout.unwrap_or(self.run_ttl);
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let session_key = options
            .session_key
            .clone()
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| format!("run:{}", options.run_id));

        let metadata = RunMetadata {
            run_id: options.run_id.clone(),
            session_key: session_key.clone(),
            lane: options.lane.unwrap_or_default(),
            source: options.source.unwrap_or_default(),
            started_at: now,
            expires_at,
            cancel: options.cancel.clone(),
            conversation_id: options.conversation_id.clone(),
            execution_id: options.execution_id.clone(),
            integration_id: options.integration_id.clone(),
            user_id: options.user_id.clone(),
            tenant_id: options.tenant_id.clone(),
        };

        let mut inner = self.inner.write().await;
        // Re-registering an id replaces the old entry and its index slot.
        inner.remove(&options.run_id);
        inner.runs.insert(options.run_id.clone(), metadata.clone());
        inner
            .by_session
            .entry(session_key.clone())
            .or_default()
            .insert(options.run_id.clone());
        drop(inner);

        debug!(run_id = %options.run_id, session_key = %session_key, "Registered run");
        metadata
    }

    /// Remove a run from every index. Returns false for unknown ids.
    pub async fn complete_run(&self, run_id: &str) -> bool {
        let removed = self.inner.write().await.remove(run_id).is_some();
        if removed {
            debug!(run_id = %run_id, "Completed run");
        }
        removed
    }

    /// Look up an active run by id.
    pub async fn get_run(&self, run_id: &str) -> Option<RunMetadata> {
        self.inner.read().await.runs.get(run_id).cloned()
    }

    /// Active runs indexed under `session_key`.
    pub async fn get_runs_by_session(&self, session_key: &str) -> Vec<RunMetadata> {
        let inner = self.inner.read().await;
        let Some(ids) = inner.by_session.get(session_key) else {
            return Vec::new();
        };
        ids.iter().filter_map(|id| inner.runs.get(id).cloned()).collect()
    }

    /// Active runs bound to a conversation.
    pub async fn get_runs_by_conversation(&self, conversation_id: &str) -> Vec<RunMetadata> {
        self.filter(|m| m.conversation_id.as_deref() == Some(conversation_id))
            .await
    }

    /// Active runs bound to an integration.
    pub async fn get_runs_by_integration(&self, integration_id: &str) -> Vec<RunMetadata> {
        self.filter(|m| m.integration_id.as_deref() == Some(integration_id))
            .await
    }

    /// Snapshot of every active run.
    pub async fn get_all_runs(&self) -> Vec<RunMetadata> {
        self.filter(|_| true).await
    }

    async fn filter<F>(&self, predicate: F) -> Vec<RunMetadata>
    where
        F: Fn(&RunMetadata) -> bool,
    {
        self.inner
            .read()
            .await
            .runs
            .values()
            .filter(|m| predicate(m))
            .cloned()
            .collect()
    }

    /// Signal cancellation for one run. The run stays registered until its
    /// task settles. Already-cancelled runs are not signalled again.
    pub async fn abort_by_run_id(&self, run_id: &str, reason: Option<&str>) -> bool {
        let Some(meta) = self.get_run(run_id).await else {
            return false;
        };
        signal(&meta, reason.unwrap_or("canceled"));
        true
    }

    /// Signal cancellation for every run under a session key. Returns the
    /// aborted run ids; runs stay registered until their tasks settle.
    pub async fn abort_by_session_key(&self, session_key: &str, reason: Option<&str>) -> Vec<String> {
        let runs = self.get_runs_by_session(session_key).await;
        if runs.is_empty() {
            return Vec::new();
        }
        let aborted = abort_all(&runs, reason);
        info!(session_key = %session_key, count = aborted.len(), "Aborted runs for session");
        aborted
    }

    /// Signal cancellation for every run bound to a conversation.
    pub async fn abort_by_conversation(
        &self,
        conversation_id: &str,
        reason: Option<&str>,
    ) -> Vec<String> {
        let runs = self.get_runs_by_conversation(conversation_id).await;
        abort_all(&runs, reason)
    }

    /// Signal cancellation for every run bound to an integration.
    pub async fn abort_by_integration(
        &self,
        integration_id: &str,
        reason: Option<&str>,
    ) -> Vec<String> {
        let runs = self.get_runs_by_integration(integration_id).await;
        abort_all(&runs, reason)
    }

    /// Cancel and remove every run whose expiry has passed.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<RunMetadata> = {
            let mut inner = self.inner.write().await;
            let ids: Vec<String> = inner
                .runs
                .values()
                .filter(|m| m.is_expired_at(now))
                .map(|m| m.run_id.clone())
                .collect();
            ids.iter().filter_map(|id| inner.remove(id)).collect()
        };

        for meta in &expired {
            signal(meta, "Run expired");
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Swept expired runs");
        }
        expired.len()
    }

    /// Cancel every active run and clear all indices.
    pub async fn shutdown(&self) {
        let runs: Vec<RunMetadata> = {
            let mut inner = self.inner.write().await;
            inner.by_session.clear();
            inner.runs.drain().map(|(_, meta)| meta).collect()
        };
        for meta in &runs {
            signal(meta, "Registry shut down");
        }
        if !runs.is_empty() {
            info!(count = runs.len(), "Cancelled active runs on shutdown");
        }
    }

    /// Number of active runs.
    pub async fn get_run_count(&self) -> usize {
        self.inner.read().await.runs.len()
    }

    /// Number of active runs tagged with `lane`.
    pub async fn get_run_count_by_lane(&self, lane: Lane) -> usize {
        self.count(|m| m.lane == lane).await
    }

    /// Number of active runs started from `source`.
    pub async fn get_run_count_by_source(&self, source: RunSource) -> usize {
        self.count(|m| m.source == source).await
    }

    /// Number of active runs bound to an integration.
    pub async fn get_run_count_by_integration(&self, integration_id: &str) -> usize {
        self.count(|m| m.integration_id.as_deref() == Some(integration_id))
            .await
    }

    async fn count<F>(&self, predicate: F) -> usize
    where
        F: Fn(&RunMetadata) -> bool,
    {
        self.inner
            .read()
            .await
            .runs
            .values()
            .filter(|m| predicate(m))
            .count()
    }
}

fn signal(meta: &RunMetadata, reason: &str) {
    if !meta.cancel.is_cancelled() {
        info!(run_id = %meta.run_id, reason = %reason, "Aborting run");
        meta.cancel.cancel();
    }
}

fn abort_all(runs: &[RunMetadata], reason: Option<&str>) -> Vec<String> {
    runs.iter()
        .map(|meta| {
            signal(meta, reason.unwrap_or("canceled"));
            meta.run_id.clone()
        })
        .collect()
}

/// Spawn a background task that periodically sweeps expired runs.
pub fn spawn_sweep_task(registry: Arc<RunRegistry>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        // The first tick completes immediately.
        tick.tick().await;
        loop {
            tick.tick().await;
            registry.sweep_expired().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn registry() -> RunRegistry {
        RunRegistry::new(Duration::from_secs(600))
    }

    #[tokio::test]
    async fn register_and_complete() {
        let registry = registry();
        let meta = registry
            .register_run(&RunOptions::new("r1").with_session_key("chat:conversation:c1"))
            .await;
        assert_eq!(meta.lane, Lane::Main);
        assert_eq!(meta.source, RunSource::Chat);
        assert!(registry.get_run("r1").await.is_some());
        assert_eq!(registry.get_runs_by_session("chat:conversation:c1").await.len(), 1);

        assert!(registry.complete_run("r1").await);
        assert!(registry.get_run("r1").await.is_none());
        assert!(registry.get_runs_by_session("chat:conversation:c1").await.is_empty());
        assert!(!registry.complete_run("r1").await);
    }

    #[tokio::test]
    async fn session_key_defaults_to_run_id() {
        let registry = registry();
        let meta = registry.register_run(&RunOptions::new("abc")).await;
        assert_eq!(meta.session_key, "run:abc");
    }

    #[tokio::test]
    async fn expiry_uses_timeout_or_ttl() {
        let registry = registry();
        let with_timeout = registry
            .register_run(&RunOptions::new("a").with_timeout(Duration::from_secs(5)))
            .await;
        let span = with_timeout.expires_at - with_timeout.started_at;
        assert_eq!(span.num_seconds(), 5);

        let with_ttl = registry.register_run(&RunOptions::new("b")).await;
        let span = with_ttl.expires_at - with_ttl.started_at;
        assert_eq!(span.num_seconds(), 600);
    }

    #[tokio::test]
    async fn abort_by_session_signals_tokens() {
        let registry = registry();
        let token = CancellationToken::new();
        registry
            .register_run(
                &RunOptions::new("r1")
                    .with_session_key("chat:conversation:c1")
                    .with_cancel(token.clone()),
            )
            .await;
        registry
            .register_run(&RunOptions::new("r2").with_session_key("chat:conversation:c2"))
            .await;

        let aborted = registry
            .abort_by_session_key("chat:conversation:c1", Some("user stop"))
            .await;
        assert_eq!(aborted, vec!["r1".to_string()]);
        assert!(token.is_cancelled());
        // Aborting does not unregister; the runner does that when the task settles.
        assert!(registry.get_run("r1").await.is_some());

        // Idempotent.
        let again = registry.abort_by_session_key("chat:conversation:c1", None).await;
        assert_eq!(again, vec!["r1".to_string()]);
        assert!(registry.abort_by_session_key("missing", None).await.is_empty());
    }

    #[tokio::test]
    async fn abort_by_conversation_and_integration() {
        let registry = registry();
        registry
            .register_run(&RunOptions::new("r1").with_conversation("conv-1"))
            .await;
        registry
            .register_run(&RunOptions::new("r2").with_integration("lark-1"))
            .await;
        registry
            .register_run(&RunOptions::new("r3").with_integration("lark-1"))
            .await;

        assert_eq!(registry.abort_by_conversation("conv-1", None).await, vec!["r1"]);
        let mut by_integration = registry.abort_by_integration("lark-1", None).await;
        by_integration.sort();
        assert_eq!(by_integration, vec!["r2", "r3"]);
        assert_eq!(registry.get_run_count_by_integration("lark-1").await, 2);
        assert!(!registry.abort_by_run_id("nope", None).await);
    }

    #[tokio::test]
    async fn sweep_removes_expired_runs() {
        let registry = registry();
        let token = CancellationToken::new();
        registry
            .register_run(
                &RunOptions::new("short")
                    .with_timeout(Duration::from_millis(1))
                    .with_cancel(token.clone()),
            )
            .await;
        registry.register_run(&RunOptions::new("long")).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.sweep_expired().await, 1);
        assert!(token.is_cancelled());
        assert!(registry.get_run("short").await.is_none());
        assert_eq!(registry.get_run_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweep_removes_expired_runs() {
        let registry = Arc::new(registry());
        let token = CancellationToken::new();
        registry
            .register_run(
                &RunOptions::new("short")
                    .with_timeout(Duration::from_millis(1))
                    .with_cancel(token.clone()),
            )
            .await;
        registry.register_run(&RunOptions::new("long")).await;
        // Expiry is wall-clock based; the paused tokio clock only drives the sweep interval.
        std::thread::sleep(Duration::from_millis(5));

        let sweeper = spawn_sweep_task(Arc::clone(&registry), Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(registry.get_run("short").await.is_some());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(token.is_cancelled());
        assert!(registry.get_run("short").await.is_none());
        assert!(registry.get_run("long").await.is_some());

        sweeper.abort();
    }

    #[tokio::test]
    async fn counts_by_lane_and_source() {
        let registry = registry();
        registry
            .register_run(&RunOptions::new("a").with_lane(Lane::Cron).with_source(RunSource::Cron))
            .await;
        registry
            .register_run(&RunOptions::new("b").with_lane(Lane::Cron))
            .await;
        registry.register_run(&RunOptions::new("c")).await;

        assert_eq!(registry.get_run_count_by_lane(Lane::Cron).await, 2);
        assert_eq!(registry.get_run_count_by_lane(Lane::Main).await, 1);
        assert_eq!(registry.get_run_count_by_source(RunSource::Cron).await, 1);
        assert_eq!(registry.get_all_runs().await.len(), 3);
    }

    #[tokio::test]
    async fn shutdown_cancels_everything() {
        let registry = registry();
        let token = CancellationToken::new();
        registry
            .register_run(&RunOptions::new("a").with_cancel(token.clone()))
            .await;
        registry.shutdown().await;
        assert!(token.is_cancelled());
        assert_eq!(registry.get_run_count().await, 0);
        assert!(registry.get_runs_by_session("run:a").await.is_empty());
    }
}
