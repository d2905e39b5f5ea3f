//! Pre-mutation guard: refuse to run against indices that are already
//! write-blocked by someone else (an operator, a watermark breach, or a
//! previous migration that never cleaned up).

use async_trait::async_trait;
use std::sync::Arc;

use crate::context::MigrationContext;
use crate::error::{RepositoryError, StepError};
use crate::repository::StepRepository;
use crate::status::{StepExecutionStatus, StepResult};
use crate::steps::MigrationStep;

pub struct CheckIndicesNotBlockedStep {
    repo: Arc<dyn StepRepository>,
}

impl CheckIndicesNotBlockedStep {
    pub fn new(repo: Arc<dyn StepRepository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl MigrationStep for CheckIndicesNotBlockedStep {
    fn name(&self) -> &'static str {
        "check-indices-not-blocked"
    }

    async fn execute(&self, ctx: &mut MigrationContext) -> Result<StepResult, StepError> {
        let names = ctx.data_indices()?.to_vec();

        let settings = match self.repo.get_settings(&names).await {
            Ok(settings) => settings,
            // A store-level block exception while *reading* settings still
            // means the indices are not usable; map it instead of treating
            // it as unexpected.
            Err(RepositoryError::Blocked { index }) => {
                return Ok(StepResult::failure(
                    StepExecutionStatus::DataIndicesLockedError,
                    "store reported a write block while checking settings",
                    format!("block exception raised for '{index}'"),
                ));
            }
            Err(e) => return Err(e.into()),
        };

        let mut details = Vec::new();
        let mut problems = 0usize;
        for name in &names {
            match settings.get(name) {
                Some(Some(s)) if s.write_blocked => {
                    problems += 1;
                    details.push(format!("{name}: blocked"));
                }
                Some(Some(_)) => details.push(format!("{name}: lock free")),
                _ => {
                    problems += 1;
                    details.push(format!("{name}: settings not available"));
                }
            }
        }

        if problems == 0 {
            Ok(StepResult::ok(
                format!("{} indices lock free", names.len()),
                details.join("\n"),
            ))
        } else {
            Ok(StepResult::failure(
                StepExecutionStatus::DataIndicesLockedError,
                format!("{problems} of {} indices not usable", names.len()),
                details.join("\n"),
            ))
        }
    }
}
