//! Terminal outcome taxonomy for pipeline steps.
//!
//! Every step execution ends in exactly one `StepExecutionStatus`. The
//! orchestrator makes all of its control-flow decisions from this vocabulary:
//! success values continue the pipeline, compensable failures trigger the
//! reverse rollback walk, fatal failures abort without compensation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How the orchestrator reacts to a failure status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Abort immediately, run no compensations. Used when ownership of the
    /// run is unknown (lock errors) or when the partial effect of a step is
    /// unknown (unexpected errors).
    Fatal,
    /// Walk the executed steps in reverse and run their compensations.
    Compensable,
}

/// Closed enumeration of step outcomes.
///
/// Wire names are the SCREAMING_SNAKE_CASE form, grouped here by pipeline
/// phase: success, lock subsystem, validation/resolution, resource state,
/// backup, copy, verification, cleanup/compensation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepExecutionStatus {
    // Success
    Ok,
    Rollback,

    // Internal / unknown partial effect
    UnexpectedError,

    // Lock subsystem
    MigrationAlreadyInProgressError,
    CannotCreateStatusDocumentLockError,
    CannotUpdateStatusDocumentLockError,

    // Validation / resolution
    GlobalTenantNotFoundError,
    TenantIndexNameConflictError,
    CannotResolveIndexByAliasError,

    // Resource state
    DataIndicesLockedError,
    CannotBlockIndicesError,
    CannotUnblockIndicesError,

    // Backup
    InvalidBackupIndexNameError,
    InvalidDateInBackupIndexNameError,
    BackupFromPreviousMigrationNotAvailableError,
    BackupContainsMigratedDataError,
    CannotCreateBackupIndexError,

    // Copy
    CannotCreateGlobalIndexError,
    SlicePartialError,
    DocumentCopyError,

    // Verification
    MissingDocumentsInBackupError,
    MissingDocumentsInGlobalTenantIndexError,

    // Cleanup / compensation
    CannotDeleteIndexError,
    CannotRestoreFromBackupError,
}

impl StepExecutionStatus {
    /// Whether this status counts as a successful step outcome.
    pub fn success(self) -> bool {
        matches!(self, Self::Ok | Self::Rollback)
    }

    /// Failure classification; `None` for success statuses.
    pub fn failure_class(self) -> Option<FailureClass> {
        if self.success() {
            return None;
        }
        let class = match self {
            Self::UnexpectedError
            | Self::MigrationAlreadyInProgressError
            | Self::CannotCreateStatusDocumentLockError
            | Self::CannotUpdateStatusDocumentLockError => FailureClass::Fatal,
            _ => FailureClass::Compensable,
        };
        Some(class)
    }

    /// `true` for failures that must abort the run without compensation.
    pub fn is_fatal(self) -> bool {
        self.failure_class() == Some(FailureClass::Fatal)
    }
}

impl fmt::Display for StepExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The serde rename is the canonical operator-facing spelling.
        let name = serde_json::to_value(self).map_err(|_| fmt::Error)?;
        match name {
            serde_json::Value::String(s) => write!(f, "{s}"),
            _ => Err(fmt::Error),
        }
    }
}

/// Immutable outcome of one step execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// Terminal status of the step.
    pub status: StepExecutionStatus,
    /// Short human-readable message.
    pub summary: String,
    /// Free-text diagnostic, e.g. a per-index breakdown.
    pub details: String,
}

impl StepResult {
    pub fn new(
        status: StepExecutionStatus,
        summary: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            status,
            summary: summary.into(),
            details: details.into(),
        }
    }

    /// Successful outcome.
    pub fn ok(summary: impl Into<String>, details: impl Into<String>) -> Self {
        Self::new(StepExecutionStatus::Ok, summary, details)
    }

    /// Failure outcome with an explicit taxonomy status.
    pub fn failure(
        status: StepExecutionStatus,
        summary: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        debug_assert!(!status.success(), "failure() requires a failure status");
        Self::new(status, summary, details)
    }

    /// Whether the step succeeded.
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

impl fmt::Display for StepResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.summary)
    }
}
