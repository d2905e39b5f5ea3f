//! Source cleanup and its compensation.
//!
//! After verification the per-tenant source indices are superseded by the
//! consolidated destination and get deleted. The compensating step rebuilds
//! them from the verified backups if anything after the deletion fails.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use crate::context::MigrationContext;
use crate::error::StepError;
use crate::repository::{IndexSettings, StepRepository};
use crate::status::{StepExecutionStatus, StepResult};
use crate::steps::backup::validate_backup_name;
use crate::steps::copy::copy_index;
use crate::steps::MigrationStep;

pub struct DeleteSourceIndicesStep {
    repo: Arc<dyn StepRepository>,
}

impl DeleteSourceIndicesStep {
    pub fn new(repo: Arc<dyn StepRepository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl MigrationStep for DeleteSourceIndicesStep {
    fn name(&self) -> &'static str {
        "delete-source-indices"
    }

    async fn execute(&self, ctx: &mut MigrationContext) -> Result<StepResult, StepError> {
        let sources = ctx.data_indices()?.to_vec();
        for source in &sources {
            ctx.require_known_index(source)?;
            if let Err(e) = self.repo.delete_index(source).await {
                return Ok(StepResult::failure(
                    StepExecutionStatus::CannotDeleteIndexError,
                    format!("failed to delete source index '{source}'"),
                    e.to_string(),
                ));
            }
        }
        info!(count = sources.len(), "source indices deleted");
        Ok(StepResult::ok(
            format!("{} source indices deleted", sources.len()),
            sources.join("\n"),
        ))
    }
}

/// Compensation for `delete-source-indices`: recreate every source from its
/// backup. A source that still exists with the full document count is left
/// untouched, so re-running a half-finished restore converges.
pub struct RestoreFromBackupStep {
    repo: Arc<dyn StepRepository>,
    batch_size: usize,
}

impl RestoreFromBackupStep {
    pub fn new(repo: Arc<dyn StepRepository>, batch_size: usize) -> Self {
        Self { repo, batch_size }
    }
}

#[async_trait]
impl MigrationStep for RestoreFromBackupStep {
    fn name(&self) -> &'static str {
        "restore-from-backup"
    }

    async fn execute(&self, ctx: &mut MigrationContext) -> Result<StepResult, StepError> {
        let backups = ctx.backup_indices().to_vec();
        let mut details = Vec::new();

        for backup in &backups {
            let source = match validate_backup_name(backup) {
                Ok(source) => source.to_string(),
                Err(status) => {
                    return Ok(StepResult::failure(
                        status,
                        "cannot restore from a malformed backup name",
                        backup.clone(),
                    ));
                }
            };

            let backup_docs = match self.repo.count(backup).await {
                Ok(count) => count,
                Err(e) => {
                    return Ok(StepResult::failure(
                        StepExecutionStatus::CannotRestoreFromBackupError,
                        format!("backup '{backup}' is not readable"),
                        e.to_string(),
                    ));
                }
            };

            let restore = async {
                if self.repo.index_exists(&source).await? {
                    if self.repo.count(&source).await? == backup_docs {
                        return Ok::<_, crate::error::RepositoryError>(0);
                    }
                    // Half-deleted or half-restored source; writes into it
                    // may still be blocked from earlier in the run.
                    self.repo
                        .set_write_block(std::slice::from_ref(&source), false)
                        .await?;
                } else {
                    self.repo
                        .create_index(&source, &serde_json::json!({}), &IndexSettings::default())
                        .await?;
                }
                copy_index(self.repo.as_ref(), backup, &source, None, self.batch_size).await
            };

            match restore.await {
                Ok(0) => details.push(format!("{source}: already intact")),
                Ok(restored) => {
                    info!(%source, restored, "restored index from backup");
                    details.push(format!("{source}: {restored} docs restored from {backup}"));
                }
                Err(e) => {
                    warn!(%source, error = %e, "restore from backup failed");
                    return Ok(StepResult::failure(
                        StepExecutionStatus::CannotRestoreFromBackupError,
                        format!("failed to restore '{source}' from '{backup}'"),
                        e.to_string(),
                    ));
                }
            }
        }

        Ok(StepResult::ok(
            format!("{} indices restored", backups.len()),
            details.join("\n"),
        ))
    }
}
