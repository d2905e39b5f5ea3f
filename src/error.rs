//! Error types.
//!
//! Two channels, kept deliberately separate: anything the pipeline has a
//! documented response to is a [`crate::status::StepResult`] value, never an
//! `Err`. The error types here cover the *unexpected* channel only: store
//! faults a step did not anticipate and context invariant violations, both of
//! which the orchestrator maps to `UNEXPECTED_ERROR` and treats as fatal.

use thiserror::Error;

/// Store-level failure raised by a [`crate::repository::StepRepository`].
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Index, alias or document does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Create-if-absent refused or concurrent version conflict.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The store rejected a write because the target is write-blocked.
    #[error("index '{index}' is write-blocked")]
    Blocked { index: String },

    /// Network-level failure (timeout, connection refused, 5xx).
    #[error("transport error: {0}")]
    Transport(String),

    /// Response body could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Any other non-2xx response.
    #[error("store returned HTTP {code}: {body}")]
    Status { code: u16, body: String },
}

impl RepositoryError {
    /// Whether a retry has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status { code, .. } => matches!(code, 429 | 502 | 503 | 504),
            _ => false,
        }
    }
}

/// Unexpected, non-taxonomy failure of a step.
///
/// A step returning `Err(StepError)` tells the orchestrator that its partial
/// effect is unknown; the run is aborted without compensation.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// A step referenced context state that an earlier step should have
    /// populated. Always a pipeline ordering bug, never an operator error.
    #[error("context invariant violated: {0}")]
    ContextInvariant(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_are_transient() {
        assert!(RepositoryError::Transport("timeout".into()).is_transient());
        assert!(RepositoryError::Status {
            code: 503,
            body: String::new()
        }
        .is_transient());
    }

    #[test]
    fn test_conflict_and_not_found_are_not_transient() {
        assert!(!RepositoryError::Conflict("lock".into()).is_transient());
        assert!(!RepositoryError::NotFound("idx".into()).is_transient());
        assert!(!RepositoryError::Blocked {
            index: "idx".into()
        }
        .is_transient());
        assert!(!RepositoryError::Status {
            code: 400,
            body: String::new()
        }
        .is_transient());
    }
}
