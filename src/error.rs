//! Error types for the handoff runtime.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("Run error: {0}")]
    Run(#[from] RunError),

    #[error(transparent)]
    Pending(#[from] PendingError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error(transparent)]
    LocalTask(#[from] LocalTaskError),

    /// Failure raised from inside a processor body.
    #[error("Processor failed: {0}")]
    Processor(#[from] anyhow::Error),
}

impl Error {
    /// Whether redelivering the same message can never succeed.
    ///
    /// Validation and resolution failures are permanent. Errors raised by
    /// processors are classified by their text so that the same rule holds
    /// for failures wrapped by third-party code.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Dispatch(_) => true,
            Self::LocalTask(LocalTaskError::NotFound { .. }) => true,
            Self::Config(_) => true,
            Self::Processor(e) => is_permanent_text(&format!("{e:#}")),
            Self::Pending(_) | Self::Queue(_) | Self::Run(_) | Self::LocalTask(_) => {
                is_permanent_text(&self.to_string())
            }
        }
    }

    /// Whether this error is a wait timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Pending(PendingError::Timeout { .. }))
    }
}

fn is_permanent_text(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("no handler found")
        || lower.contains("invalid message")
        || lower.contains("id is required")
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Message validation and handler resolution errors. Never retried.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Invalid message: {field} is required")]
    MissingField { field: &'static str },

    #[error("No handler found for type \"{message_type}\" in org \"{organization_id}\"")]
    NoHandler {
        message_type: String,
        organization_id: String,
    },
}

/// Execution queue errors.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Run {run_id} aborted before start")]
    AbortedBeforeStart { run_id: String },
}

/// Pending-result correlator errors.
#[derive(Debug, thiserror::Error)]
pub enum PendingError {
    #[error("A waiter is already registered for message {id}")]
    AlreadyWaiting { id: String },

    #[error("Timed out after {timeout:?} waiting for message {id}")]
    Timeout { id: String, timeout: Duration },

    #[error("Wait for message {id} cancelled: {reason}")]
    Cancelled { id: String, reason: String },

    #[error("Waiter for message {id} was dropped without a result")]
    Dropped { id: String },
}

/// Transport errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue is closed")]
    Closed,
}

/// Local-task bridge errors.
#[derive(Debug, thiserror::Error)]
pub enum LocalTaskError {
    #[error("Local task not found: {id}")]
    NotFound { id: String },

    #[error("Local task {id} failed: {reason}")]
    Failed { id: String, reason: String },
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
