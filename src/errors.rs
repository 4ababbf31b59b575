use thiserror::Error;

use crate::lifecycle::{Role, TaskStatus};

/// Failures reported by an external collaborator (data service, sink, blob store...).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Network(String),

    #[error("server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl RemoteError {
    /// Transport-level failures are worth another attempt; auth and validation are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Network(_) | RemoteError::Server { .. })
    }

    /// Map an HTTP status returned by a collaborator onto an error category
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 => RemoteError::Unauthorized(message),
            403 => RemoteError::Forbidden(message),
            404 => RemoteError::NotFound(message),
            400 | 409 | 422 => RemoteError::Validation(message),
            _ => RemoteError::Server { status, message },
        }
    }
}

/// Errors surfaced by the consistency core
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("gave up after {attempts} attempts: {source}")]
    ExhaustedRetries {
        attempts: u32,
        #[source]
        source: Box<SyncError>,
    },

    #[error("transition {from} -> {to} is not allowed for role {role}")]
    InvalidTransition {
        from: TaskStatus,
        to: TaskStatus,
        role: Role,
    },

    #[error("a reason is required when moving a task to {status}")]
    MissingReason { status: TaskStatus },

    #[error("subscription to {resource} failed: {reason}")]
    Subscription { resource: String, reason: String },

    #[error("subject {subject_id} no longer exists upstream")]
    ReferentialIntegrity { subject_id: String },

    #[error("task {task_id} was modified concurrently (expected status {expected})")]
    ConcurrentModification { task_id: String, expected: TaskStatus },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    /// Whether the request executor should try the operation again
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Timeout { .. } => true,
            SyncError::Remote(remote) => remote.is_retryable(),
            _ => false,
        }
    }

    /// Validation and permission failures surface to the caller immediately
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidTransition { .. }
                | SyncError::MissingReason { .. }
                | SyncError::ConcurrentModification { .. }
        )
    }

    /// The innermost cause, looking through `ExhaustedRetries`
    pub fn root_cause(&self) -> &SyncError {
        match self {
            SyncError::ExhaustedRetries { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(RemoteError::Network("reset".into()).is_retryable());
        assert!(RemoteError::from_status(503, "unavailable").is_retryable());
        assert!(!RemoteError::from_status(401, "expired").is_retryable());
        assert!(!RemoteError::from_status(422, "bad row").is_retryable());

        assert!(SyncError::Timeout { timeout_ms: 10 }.is_retryable());
        assert!(!SyncError::MissingReason {
            status: TaskStatus::Cancelled
        }
        .is_retryable());
    }

    #[test]
    fn test_root_cause_unwraps_exhausted() {
        let err = SyncError::ExhaustedRetries {
            attempts: 3,
            source: Box::new(SyncError::Timeout { timeout_ms: 100 }),
        };
        assert!(matches!(err.root_cause(), SyncError::Timeout { timeout_ms: 100 }));
        assert!(err.to_string().contains("3 attempts"));
    }
}
