//! Count verification.
//!
//! A count mismatch is always a failure that triggers rollback, never a
//! warning: continuing with missing documents would silently lose tenant
//! data in the consolidated layout.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::context::MigrationContext;
use crate::error::StepError;
use crate::repository::StepRepository;
use crate::status::{StepExecutionStatus, StepResult};
use crate::steps::backup::validate_backup_name;
use crate::steps::MigrationStep;

/// Compares every data index against its backup.
pub struct VerifyBackupStep {
    repo: Arc<dyn StepRepository>,
}

impl VerifyBackupStep {
    pub fn new(repo: Arc<dyn StepRepository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl MigrationStep for VerifyBackupStep {
    fn name(&self) -> &'static str {
        "verify-backup"
    }

    async fn execute(&self, ctx: &mut MigrationContext) -> Result<StepResult, StepError> {
        let backups = ctx.backup_indices().to_vec();
        let mut details = Vec::new();
        let mut mismatched = 0usize;

        for backup in &backups {
            let source = match validate_backup_name(backup) {
                Ok(source) => source.to_string(),
                Err(status) => {
                    return Ok(StepResult::failure(
                        status,
                        "registered backup index has an invalid name",
                        backup.clone(),
                    ));
                }
            };

            let expected = self.repo.count(&source).await?;
            let actual = self.repo.count(backup).await?;
            ctx.counters_mut(&source).verified = actual;

            // Any divergence fails, in either direction: a backup with
            // MORE documents than its source is a stale leftover whose
            // extra ids a restore would resurrect.
            if actual == expected {
                details.push(format!("{source}: {actual}/{expected} documents in backup"));
            } else {
                mismatched += 1;
                details.push(format!(
                    "{source}: backup {backup} holds {actual} of {expected} documents"
                ));
            }
        }

        if mismatched == 0 {
            info!(backups = backups.len(), "backup verification passed");
            Ok(StepResult::ok(
                format!("{} backups verified", backups.len()),
                details.join("\n"),
            ))
        } else {
            Ok(StepResult::failure(
                StepExecutionStatus::MissingDocumentsInBackupError,
                format!(
                    "{mismatched} of {} backups diverge from their sources",
                    backups.len()
                ),
                details.join("\n"),
            ))
        }
    }
}

/// Compares the total of expected documents against the destination count.
pub struct VerifyMigrationStep {
    repo: Arc<dyn StepRepository>,
}

impl VerifyMigrationStep {
    pub fn new(repo: Arc<dyn StepRepository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl MigrationStep for VerifyMigrationStep {
    fn name(&self) -> &'static str {
        "verify-migration"
    }

    async fn execute(&self, ctx: &mut MigrationContext) -> Result<StepResult, StepError> {
        let target = ctx.target_index()?.to_string();
        let expected = ctx.total_expected();
        let actual = self.repo.count(&target).await?;

        if actual == expected {
            info!(%target, expected, "migration verification passed");
            Ok(StepResult::ok(
                format!("{actual} documents verified in {target}"),
                format!("expected {expected}, found {actual}"),
            ))
        } else {
            Ok(StepResult::failure(
                StepExecutionStatus::MissingDocumentsInGlobalTenantIndexError,
                format!("destination holds {actual} of {expected} documents"),
                format!("index {target}: expected {expected}, found {actual}"),
            ))
        }
    }
}
