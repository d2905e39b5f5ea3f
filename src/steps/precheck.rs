//! Previous-run safety checks.
//!
//! Re-running a migration after a partial failure must be either safe or
//! explicitly refused. This step inspects leftover backup indices and the
//! destination before anything is mutated, so a naive re-invocation cannot
//! double-migrate or clobber the only remaining copy of tenant data.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use crate::context::MigrationContext;
use crate::error::StepError;
use crate::repository::StepRepository;
use crate::status::{StepExecutionStatus, StepResult};
use crate::steps::backup::{validate_backup_name, BACKUP_PREFIX};
use crate::steps::MigrationStep;

pub struct CheckPreviousBackupStep {
    repo: Arc<dyn StepRepository>,
    destination: String,
}

impl CheckPreviousBackupStep {
    pub fn new(repo: Arc<dyn StepRepository>, destination: String) -> Self {
        Self { repo, destination }
    }
}

#[async_trait]
impl MigrationStep for CheckPreviousBackupStep {
    fn name(&self) -> &'static str {
        "check-previous-backup"
    }

    async fn execute(&self, ctx: &mut MigrationContext) -> Result<StepResult, StepError> {
        let leftovers = self
            .repo
            .list_indices(&format!("{BACKUP_PREFIX}*"))
            .await?;

        // Every leftover must have a well-formed name before it can be
        // trusted as a restore source.
        for name in &leftovers {
            if let Err(status) = validate_backup_name(name) {
                return Ok(StepResult::failure(
                    status,
                    "found backup index with invalid name",
                    format!("index '{name}' does not match {BACKUP_PREFIX}<source>_<yyyyMMddHHmmss>"),
                ));
            }
        }

        let destination_docs = if self.repo.index_exists(&self.destination).await? {
            self.repo.count(&self.destination).await?
        } else {
            0
        };

        if destination_docs > 0 {
            // A previous run got as far as copying into the destination.
            if leftovers.is_empty() {
                return Ok(StepResult::failure(
                    StepExecutionStatus::BackupFromPreviousMigrationNotAvailableError,
                    "previous migration left data but no backup",
                    format!(
                        "destination '{}' holds {destination_docs} documents and no backup_* indices exist; \
                         restore or clean the destination manually before retrying",
                        self.destination
                    ),
                ));
            }
            return Ok(StepResult::failure(
                StepExecutionStatus::BackupContainsMigratedDataError,
                "destination already contains migrated data",
                format!(
                    "destination '{}' holds {destination_docs} documents while {} backup indices exist; \
                     a blind re-run would mix migrated and unmigrated data",
                    self.destination,
                    leftovers.len()
                ),
            ));
        }

        // Safe to proceed. Register leftovers so the write-block step covers
        // them and the backup step can reuse them.
        for name in &leftovers {
            warn!(index = %name, "reusing backup index from a previous run");
            ctx.add_backup_index(name.clone());
        }

        let detail = if leftovers.is_empty() {
            "no leftover backup indices".to_string()
        } else {
            leftovers.join("\n")
        };
        Ok(StepResult::ok(
            format!("{} leftover backup indices", leftovers.len()),
            detail,
        ))
    }
}
