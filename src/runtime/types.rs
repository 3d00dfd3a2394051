//! Run bookkeeping types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Descriptive concurrency class of a run. Used for reporting only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    #[default]
    Main,
    Subagent,
    Cron,
    Nested,
}

impl Lane {
    pub const ALL: [Lane; 4] = [Lane::Main, Lane::Subagent, Lane::Cron, Lane::Nested];

    /// Wire name of the lane.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Subagent => "subagent",
            Self::Cron => "cron",
            Self::Nested => "nested",
        }
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a run originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunSource {
    #[default]
    Chat,
    Api,
    Subagent,
    Cron,
    Channel,
    Handoff,
    Local,
}

impl std::fmt::Display for RunSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Chat => "chat",
            Self::Api => "api",
            Self::Subagent => "subagent",
            Self::Cron => "cron",
            Self::Channel => "channel",
            Self::Handoff => "handoff",
            Self::Local => "local",
        };
        write!(f, "{s}")
    }
}

/// Options for registering (and executing) a run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub run_id: String,
    /// Grouping key for cancellation. Falls back to `run:<run_id>`.
    pub session_key: Option<String>,
    pub lane: Option<Lane>,
    pub source: Option<RunSource>,
    /// Explicit timeout. Also determines the registry expiry.
    pub timeout: Option<Duration>,
    /// Cancellation handle owned by the caller.
    pub cancel: CancellationToken,
    pub conversation_id: Option<String>,
    pub execution_id: Option<String>,
    pub integration_id: Option<String>,
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
}

impl RunOptions {
    /// Options for `run_id` with every other field unset.
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            ..Default::default()
        }
    }

    pub fn with_session_key(mut self, session_key: impl Into<String>) -> Self {
        self.session_key = Some(session_key.into());
        self
    }

    pub fn with_lane(mut self, lane: Lane) -> Self {
        self.lane = Some(lane);
        self
    }

    pub fn with_source(mut self, source: RunSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_integration(mut self, integration_id: impl Into<String>) -> Self {
        self.integration_id = Some(integration_id.into());
        self
    }
}

/// Bookkeeping for one in-flight run.
///
/// Cloning shares the cancellation token, so cancelling a clone cancels the run.
#[derive(Debug, Clone)]
pub struct RunMetadata {
    pub run_id: String,
    pub session_key: String,
    pub lane: Lane,
    pub source: RunSource,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub cancel: CancellationToken,
    pub conversation_id: Option<String>,
    pub execution_id: Option<String>,
    pub integration_id: Option<String>,
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
}

impl RunMetadata {
    /// Whether the run outlived its expiry at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Lane occupancy snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaneStats {
    pub lane: Lane,
    /// Runs currently registered in this lane.
    pub active: usize,
    /// Configured capacity. Reported, not enforced.
    pub max_concurrent: usize,
}
