use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// Classification shared by every layer of the orchestrator.
///
/// The kind decides retry policy and is the only part of an error that leaves
/// the process (together with a human-readable message).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientBackend,
    QuotaExceeded,
    CorruptSnapshot,
    RoutingConflict,
    ConcurrentModification,
    InvalidTransition,
    NotFound,
    Cancelled,
    Config,
    Internal,
}

impl ErrorKind {
    /// Whether the lifecycle retry loop may attempt the call again.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::TransientBackend)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::TransientBackend => "TransientBackendError",
            ErrorKind::QuotaExceeded => "QuotaExceededError",
            ErrorKind::CorruptSnapshot => "CorruptSnapshotError",
            ErrorKind::RoutingConflict => "RoutingConflictError",
            ErrorKind::ConcurrentModification => "ConcurrentModificationError",
            ErrorKind::InvalidTransition => "InvalidTransitionError",
            ErrorKind::NotFound => "NotFoundError",
            ErrorKind::Cancelled => "CancelledError",
            ErrorKind::Config => "ConfigError",
            ErrorKind::Internal => "InternalError",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-visible shape of an error: kind plus message, nothing else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorSummary {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl Display for ErrorSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[derive(Error, Debug)]
pub enum DevEnvError {
    TransientBackend(String),
    QuotaExceeded(String),
    CorruptSnapshot {
        key: String,
        expected: String,
        actual: String,
    },
    RoutingConflict(String),
    ConcurrentModification {
        id: String,
        expected_version: i64,
    },
    InvalidTransition {
        state: String,
        trigger: String,
    },
    NotFound(String),
    Cancelled,
    Config(String),
    Internal(String),
    Io(#[from] std::io::Error),
    Environment {
        id: String,
        source: Box<DevEnvError>,
    },
}

impl Display for DevEnvError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DevEnvError::TransientBackend(s) => write!(f, "Transient backend error: {s}"),
            DevEnvError::QuotaExceeded(s) => write!(f, "Quota exceeded: {s}"),
            DevEnvError::CorruptSnapshot {
                key,
                expected,
                actual,
            } => write!(
                f,
                "Corrupt snapshot {key}: expected hash {expected}, found {actual}"
            ),
            DevEnvError::RoutingConflict(host) => {
                write!(f, "Routing conflict: host {host} is already published")
            }
            DevEnvError::ConcurrentModification {
                id,
                expected_version,
            } => write!(
                f,
                "Concurrent modification of environment {id} (expected version {expected_version})"
            ),
            DevEnvError::InvalidTransition { state, trigger } => {
                write!(f, "Invalid transition: cannot {trigger} from {state}")
            }
            DevEnvError::NotFound(s) => write!(f, "Not found: {s}"),
            DevEnvError::Cancelled => write!(f, "Operation cancelled"),
            DevEnvError::Config(s) => write!(f, "Configuration error: {s}"),
            DevEnvError::Internal(s) => write!(f, "Internal error: {s}"),
            DevEnvError::Io(e) => write!(f, "I/O error: {e}"),
            DevEnvError::Environment { id, source } => write!(f, "environment {id}: {source}"),
        }
    }
}

impl DevEnvError {
    pub fn transient(message: impl Into<String>) -> Self {
        DevEnvError::TransientBackend(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        DevEnvError::Internal(message.into())
    }

    pub fn invalid_transition(state: impl Display, trigger: impl Display) -> Self {
        DevEnvError::InvalidTransition {
            state: state.to_string(),
            trigger: trigger.to_string(),
        }
    }

    /// Attach the environment id. Already-wrapped errors are left alone.
    pub fn with_environment(self, id: &str) -> Self {
        match self {
            wrapped @ DevEnvError::Environment { .. } => wrapped,
            other => DevEnvError::Environment {
                id: id.to_string(),
                source: Box::new(other),
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DevEnvError::TransientBackend(_) => ErrorKind::TransientBackend,
            DevEnvError::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            DevEnvError::CorruptSnapshot { .. } => ErrorKind::CorruptSnapshot,
            DevEnvError::RoutingConflict(_) => ErrorKind::RoutingConflict,
            DevEnvError::ConcurrentModification { .. } => ErrorKind::ConcurrentModification,
            DevEnvError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            DevEnvError::NotFound(_) => ErrorKind::NotFound,
            DevEnvError::Cancelled => ErrorKind::Cancelled,
            DevEnvError::Config(_) => ErrorKind::Config,
            DevEnvError::Internal(_) => ErrorKind::Internal,
            // Local disk hiccups during hydrate/dehydrate are worth another attempt.
            DevEnvError::Io(_) => ErrorKind::TransientBackend,
            DevEnvError::Environment { source, .. } => source.kind(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Innermost message without the environment prefix.
    pub fn root_message(&self) -> String {
        match self {
            DevEnvError::Environment { source, .. } => source.root_message(),
            other => other.to_string(),
        }
    }

    pub fn summary(&self) -> ErrorSummary {
        ErrorSummary::new(self.kind(), self.root_message())
    }
}

pub type Result<T> = std::result::Result<T, DevEnvError>;
