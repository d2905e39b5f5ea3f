//! Pipeline step implementations.
//!
//! One module per pipeline phase. Every step is idempotent: re-executing a
//! step whose effect partially applied (a crash after blocking half the
//! indices, a resumed run that already created its backup) detects the
//! already-applied part and does not fail or double-apply.

pub mod backup;
pub mod block;
pub mod check_blocked;
pub mod cleanup;
pub mod copy;
pub mod precheck;
pub mod resolve;
pub mod target;
pub mod verify;

use async_trait::async_trait;

use crate::context::MigrationContext;
use crate::error::StepError;
use crate::status::StepResult;

/// Polymorphic unit of work in the migration pipeline.
///
/// Expected failures come back as a [`StepResult`] carrying a taxonomy
/// status; `Err` is reserved for unexpected faults whose partial effect is
/// unknown (the orchestrator aborts without compensation on those).
#[async_trait]
pub trait MigrationStep: Send + Sync {
    /// Stable identifier used for logging and report ordering.
    fn name(&self) -> &'static str;

    async fn execute(&self, ctx: &mut MigrationContext) -> Result<StepResult, StepError>;
}
