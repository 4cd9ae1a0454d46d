use devenv_core::{DevEnvError, ErrorKind, ErrorSummary};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Environment not found: {0}")]
    NotFound(String),

    #[error("Invalid transition: cannot {trigger} from {state}")]
    InvalidTransition { state: String, trigger: String },

    #[error("Concurrent modification of environment {id} (expected version {expected_version})")]
    ConcurrentModification { id: String, expected_version: i64 },

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("{0}")]
    Backend(#[from] DevEnvError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    pub fn invalid_transition(state: impl std::fmt::Display, trigger: impl std::fmt::Display) -> Self {
        OrchestratorError::InvalidTransition {
            state: state.to_string(),
            trigger: trigger.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            // Locked/busy databases clear up on their own.
            OrchestratorError::Database(_) | OrchestratorError::Io(_) => ErrorKind::TransientBackend,
            OrchestratorError::Migration(_)
            | OrchestratorError::Serialization(_)
            | OrchestratorError::InvariantViolation(_) => ErrorKind::Internal,
            OrchestratorError::NotFound(_) => ErrorKind::NotFound,
            OrchestratorError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            OrchestratorError::ConcurrentModification { .. } => ErrorKind::ConcurrentModification,
            OrchestratorError::Backend(e) => e.kind(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Caller-visible form, as persisted in `last_error`.
    pub fn summary(&self) -> ErrorSummary {
        match self {
            OrchestratorError::Backend(e) => e.summary(),
            other => ErrorSummary::new(other.kind(), other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(
            OrchestratorError::Database(sqlx::Error::PoolTimedOut).kind(),
            ErrorKind::TransientBackend
        );
        assert_eq!(
            OrchestratorError::invalid_transition("hibernated", "touch").kind(),
            ErrorKind::InvalidTransition
        );
        let wrapped: OrchestratorError =
            DevEnvError::QuotaExceeded("cpu".into()).with_environment("e1").into();
        assert_eq!(wrapped.kind(), ErrorKind::QuotaExceeded);
        assert!(!wrapped.is_retryable());
    }
}
