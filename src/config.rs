//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;

/// Reporting-only lane capacities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneConfig {
    pub main: usize,
    pub subagent: usize,
    pub cron: usize,
    pub nested: usize,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            main: 8,
            subagent: 16,
            cron: 4,
            nested: 8,
        }
    }
}

/// Handoff runtime configuration.
#[derive(Debug, Clone)]
pub struct HandoffConfig {
    /// Delay between a client disconnect and cancelling its run.
    pub client_disconnect_grace: Duration,
    /// Maximum number of queue jobs processed concurrently.
    pub worker_concurrency: usize,
    /// Default timeout for a pending-result wait.
    pub pending_timeout: Duration,
    /// Run expiry when no explicit timeout is given.
    pub run_ttl: Duration,
    /// Lane capacities, exposed for reporting only.
    pub lanes: LaneConfig,
    /// Default `maxAttempts` for messages that do not set one.
    pub max_attempts: u32,
    /// Base requeue delay after a transient processor error.
    pub retry_backoff: Duration,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            client_disconnect_grace: Duration::from_secs(30),
            worker_concurrency: 20,
            pending_timeout: Duration::from_secs(120),
            run_ttl: Duration::from_secs(600), // 10 minutes
            lanes: LaneConfig::default(),
            max_attempts: 3,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

impl HandoffConfig {
    /// Build a config from `HANDOFF_*` environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let millis = |key: &str, default: Duration| -> Result<Duration, ConfigError> {
            Ok(parse_positive(&lookup, key)?
                .map(Duration::from_millis)
                .unwrap_or(default))
        };
        let count = |key: &str, default: usize| -> Result<usize, ConfigError> {
            Ok(parse_positive(&lookup, key)?
                .map(|v| v as usize)
                .unwrap_or(default))
        };

        Ok(Self {
            client_disconnect_grace: millis(
                "HANDOFF_CLIENT_DISCONNECT_GRACE_MS",
                defaults.client_disconnect_grace,
            )?,
            worker_concurrency: count("HANDOFF_WORKER_CONCURRENCY", defaults.worker_concurrency)?,
            pending_timeout: millis("HANDOFF_PENDING_TIMEOUT_MS", defaults.pending_timeout)?,
            run_ttl: millis("HANDOFF_RUN_TTL_MS", defaults.run_ttl)?,
            lanes: LaneConfig {
                main: count("HANDOFF_LANE_MAIN_CONCURRENCY", defaults.lanes.main)?,
                subagent: count("HANDOFF_LANE_SUBAGENT_CONCURRENCY", defaults.lanes.subagent)?,
                cron: count("HANDOFF_LANE_CRON_CONCURRENCY", defaults.lanes.cron)?,
                nested: count("HANDOFF_LANE_NESTED_CONCURRENCY", defaults.lanes.nested)?,
            },
            max_attempts: count("HANDOFF_MAX_ATTEMPTS", defaults.max_attempts as usize)? as u32,
            retry_backoff: millis("HANDOFF_RETRY_BACKOFF_MS", defaults.retry_backoff)?,
        })
    }

    /// Interval of the background run sweep.
    pub fn sweep_interval(&self) -> Duration {
        (self.run_ttl / 2).max(Duration::from_secs(1))
    }
}

fn parse_positive<F>(lookup: &F, key: &str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    match raw.parse::<u64>() {
        Ok(0) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        }),
        Ok(v) => Ok(Some(v)),
        Err(e) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?} is not a number: {e}"),
        }),
    }
}
