//! Engine error taxonomy
//!
//! Only conditions that stop a submission from being graded live here.
//! Compile errors, timeouts and resource violations are outcomes of the
//! student's code and are reported inside the `SubmissionReport` instead.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::languages::LanguageId;

/// Why the scheduler refused a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverloadReason {
    /// The bounded wait queue is full
    QueueFull,
    /// The submitting user exhausted their in-flight or rate budget
    UserBudget,
}

impl fmt::Display for OverloadReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OverloadReason::QueueFull => "queue_full",
            OverloadReason::UserBudget => "user_budget",
        };
        write!(f, "{}", s)
    }
}

/// The sandbox could not be started or torn down. Always a host problem.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create sandbox scope under {root}: {source}")]
    ScopeCreate {
        root: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("stale sandbox scopes could not be removed: {0:?}")]
    ScopeCleanup(Vec<PathBuf>),

    #[error("sandbox I/O failed ({context}): {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("required isolation is unavailable: {0}")]
    IsolationUnavailable(String),

    #[error("failed to wait for sandboxed process: {0}")]
    Wait(#[source] std::io::Error),
}

impl LaunchError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        LaunchError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Failure of a single sandboxed process run
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("run cancelled")]
    Cancelled,
}

impl From<RunError> for EngineError {
    fn from(err: RunError) -> Self {
        match err {
            RunError::Launch(e) => EngineError::Launch(e),
            RunError::Cancelled => EngineError::Cancelled,
        }
    }
}

/// Errors returned by the engine's public operations
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("language {0} is not allowed for this assignment")]
    LanguageNotAllowed(LanguageId),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("engine overloaded ({0}), retry later")]
    Overloaded(OverloadReason),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("request cancelled")]
    Cancelled,

    #[error("engine is shutting down")]
    ShuttingDown,
}

impl EngineError {
    /// Overload is the only condition where retrying is the documented remedy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Overloaded(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_overload_is_retryable() {
        assert!(EngineError::Overloaded(OverloadReason::QueueFull).is_retryable());
        assert!(EngineError::Overloaded(OverloadReason::UserBudget).is_retryable());
        assert!(!EngineError::Cancelled.is_retryable());
        assert!(!EngineError::InvalidRequest("empty".into()).is_retryable());
        assert!(!EngineError::Launch(LaunchError::ScopeCleanup(vec![])).is_retryable());
    }

    #[test]
    fn test_display_messages() {
        let err = EngineError::Overloaded(OverloadReason::QueueFull);
        assert_eq!(err.to_string(), "engine overloaded (queue_full), retry later");

        let err = EngineError::LanguageNotAllowed(LanguageId::Java);
        assert_eq!(err.to_string(), "language java is not allowed for this assignment");
    }
}
