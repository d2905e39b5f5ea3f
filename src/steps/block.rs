//! Write blocking and unblocking.
//!
//! `block-writes` freezes the resources the copy steps read from so the
//! document counts stay comparable; `unblock-writes` is both the final
//! forward step and the compensation for the block. Both are idempotent:
//! the store treats setting an already-set flag as a no-op.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::context::MigrationContext;
use crate::error::StepError;
use crate::repository::StepRepository;
use crate::status::{StepExecutionStatus, StepResult};
use crate::steps::MigrationStep;

pub struct BlockWritesStep {
    repo: Arc<dyn StepRepository>,
}

impl BlockWritesStep {
    pub fn new(repo: Arc<dyn StepRepository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl MigrationStep for BlockWritesStep {
    fn name(&self) -> &'static str {
        "block-writes"
    }

    async fn execute(&self, ctx: &mut MigrationContext) -> Result<StepResult, StepError> {
        // Leftover backups from a resumed run first, then the data indices.
        let mut names: Vec<String> = ctx.backup_indices().to_vec();
        names.extend(ctx.data_indices()?.iter().cloned());

        if let Err(e) = self.repo.set_write_block(&names, true).await {
            return Ok(StepResult::failure(
                StepExecutionStatus::CannotBlockIndicesError,
                "failed to block writes",
                e.to_string(),
            ));
        }

        info!(count = names.len(), "write-blocked indices");
        Ok(StepResult::ok(
            format!("{} indices write-blocked", names.len()),
            names.join("\n"),
        ))
    }
}

/// Clears the write block from every index this run may have blocked: the
/// backups, the data indices (if still present) and the destination.
pub struct UnblockWritesStep {
    repo: Arc<dyn StepRepository>,
}

impl UnblockWritesStep {
    pub fn new(repo: Arc<dyn StepRepository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl MigrationStep for UnblockWritesStep {
    fn name(&self) -> &'static str {
        "unblock-writes"
    }

    async fn execute(&self, ctx: &mut MigrationContext) -> Result<StepResult, StepError> {
        let mut names: Vec<String> = ctx.backup_indices().to_vec();
        if let Ok(data) = ctx.data_indices() {
            names.extend(data.iter().cloned());
        }
        if let Ok(target) = ctx.target_index() {
            names.push(target.to_string());
        }

        // Deleted indices are unblocked by definition; the repository treats
        // clearing the flag on a missing index as a no-op.
        if let Err(e) = self.repo.set_write_block(&names, false).await {
            return Ok(StepResult::failure(
                StepExecutionStatus::CannotUnblockIndicesError,
                "failed to unblock writes",
                e.to_string(),
            ));
        }

        Ok(StepResult::ok(
            format!("{} indices unblocked", names.len()),
            names.join("\n"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryRepository;

    #[tokio::test]
    async fn test_block_lists_backups_before_data() {
        let repo = Arc::new(InMemoryRepository::new());
        repo.seed_index("data_a", 1).await;
        repo.seed_index("backup_data_a_20240101120000", 1).await;

        let mut ctx = MigrationContext::new();
        ctx.add_backup_index("backup_data_a_20240101120000".into());
        ctx.set_data_indices(vec!["data_a".into()]).unwrap();

        let step = BlockWritesStep::new(Arc::clone(&repo) as Arc<dyn StepRepository>);
        let result = step.execute(&mut ctx).await.unwrap();

        assert_eq!(result.status, StepExecutionStatus::Ok);
        let lines: Vec<&str> = result.details.lines().collect();
        assert_eq!(lines, ["backup_data_a_20240101120000", "data_a"]);
        assert!(repo.is_blocked("data_a").await);
        assert!(repo.is_blocked("backup_data_a_20240101120000").await);
    }

    #[tokio::test]
    async fn test_block_is_idempotent() {
        let repo = Arc::new(InMemoryRepository::new());
        repo.seed_index("data_a", 1).await;
        repo.set_blocked("data_a", true).await;

        let mut ctx = MigrationContext::new();
        ctx.set_data_indices(vec!["data_a".into()]).unwrap();

        let step = BlockWritesStep::new(Arc::clone(&repo) as Arc<dyn StepRepository>);
        let result = step.execute(&mut ctx).await.unwrap();

        assert_eq!(result.status, StepExecutionStatus::Ok);
        assert!(repo.is_blocked("data_a").await);
    }

    #[tokio::test]
    async fn test_unblock_tolerates_deleted_indices() {
        let repo = Arc::new(InMemoryRepository::new());
        repo.seed_index("data_a", 1).await;
        repo.set_blocked("data_a", true).await;

        let mut ctx = MigrationContext::new();
        ctx.set_data_indices(vec!["data_a".into()]).unwrap();
        // Backup was already deleted by an earlier compensation.
        ctx.add_backup_index("backup_data_a_20240101120000".into());

        let step = UnblockWritesStep::new(Arc::clone(&repo) as Arc<dyn StepRepository>);
        let result = step.execute(&mut ctx).await.unwrap();

        assert_eq!(result.status, StepExecutionStatus::Ok);
        assert!(!repo.is_blocked("data_a").await);
    }
}
