//! Distributed run lock.
//!
//! The singleton status document doubles as the lock: whoever creates it (or
//! takes over a stale one) owns the run. Every stage boundary renews the
//! lock, which both proves liveness to other would-be runners and detects a
//! takeover by a competing process. Lock failures are always fatal, never
//! compensated, because a lost lock means another process may already be
//! mutating the same indices.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::pipeline::MigrationState;
use crate::repository::{PutMode, StatusDocument, StepRepository};
use crate::status::{StepExecutionStatus, StepResult};

pub struct RunLock {
    repo: Arc<dyn StepRepository>,
    run_id: Uuid,
    stale_after_secs: u64,
}

impl RunLock {
    pub fn new(repo: Arc<dyn StepRepository>, run_id: Uuid, stale_after_secs: u64) -> Self {
        Self {
            repo,
            run_id,
            stale_after_secs,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Claim the lock. Fails with `MIGRATION_ALREADY_IN_PROGRESS_ERROR` when
    /// another run holds a live lock, and takes over a `Running` document
    /// whose owner has stopped renewing it.
    pub async fn acquire(&self) -> Result<(), StepResult> {
        let existing = self.repo.get_status_document().await.map_err(|e| {
            StepResult::failure(
                StepExecutionStatus::CannotCreateStatusDocumentLockError,
                "cannot read migration status document",
                e.to_string(),
            )
        })?;

        let doc = StatusDocument::new(self.run_id, MigrationState::Running);

        match existing {
            Some(current) if current.state == MigrationState::Running => {
                if !current.is_stale(Utc::now(), self.stale_after_secs) {
                    return Err(StepResult::failure(
                        StepExecutionStatus::MigrationAlreadyInProgressError,
                        "another migration run is in progress",
                        format!(
                            "run {} last renewed the lock at {}",
                            current.run_id, current.last_updated_at
                        ),
                    ));
                }
                warn!(
                    abandoned_run = %current.run_id,
                    last_updated = %current.last_updated_at,
                    "taking over a stale migration lock"
                );
                self.put(&doc, PutMode::Overwrite).await
            }
            Some(_) => {
                // Previous run finished; replace its terminal record.
                self.put(&doc, PutMode::Overwrite).await
            }
            None => match self.repo.put_status_document(&doc, PutMode::CreateIfAbsent).await {
                Ok(()) => {
                    debug!(run_id = %self.run_id, "migration lock acquired");
                    Ok(())
                }
                Err(crate::error::RepositoryError::Conflict(_)) => Err(StepResult::failure(
                    StepExecutionStatus::MigrationAlreadyInProgressError,
                    "another migration run acquired the lock first",
                    String::new(),
                )),
                Err(e) => Err(StepResult::failure(
                    StepExecutionStatus::CannotCreateStatusDocumentLockError,
                    "cannot create migration status document",
                    e.to_string(),
                )),
            },
        }
    }

    /// Renew the lock, recording `state`. Fails when the document vanished or
    /// another run took the lock over.
    pub async fn renew(&self, state: MigrationState) -> Result<(), StepResult> {
        let current = self
            .repo
            .get_status_document()
            .await
            .map_err(|e| self.update_failure("cannot read migration status document", &e))?;

        let Some(mut doc) = current else {
            return Err(StepResult::failure(
                StepExecutionStatus::CannotUpdateStatusDocumentLockError,
                "migration status document disappeared",
                String::new(),
            ));
        };
        if doc.run_id != self.run_id {
            return Err(StepResult::failure(
                StepExecutionStatus::CannotUpdateStatusDocumentLockError,
                "migration lock was taken over by another run",
                format!("lock is now held by run {}", doc.run_id),
            ));
        }

        doc.state = state;
        doc.last_updated_at = Utc::now();
        self.put(&doc, PutMode::Overwrite).await
    }

    /// Record the terminal state and release the lock. The document is kept
    /// so the next run can see how this one ended.
    pub async fn release(&self, state: MigrationState) -> Result<(), StepResult> {
        debug!(run_id = %self.run_id, ?state, "releasing migration lock");
        self.renew(state).await
    }

    async fn put(&self, doc: &StatusDocument, mode: PutMode) -> Result<(), StepResult> {
        self.repo
            .put_status_document(doc, mode)
            .await
            .map_err(|e| self.update_failure("cannot write migration status document", &e))
    }

    fn update_failure(
        &self,
        summary: &str,
        error: &crate::error::RepositoryError,
    ) -> StepResult {
        StepResult::failure(
            StepExecutionStatus::CannotUpdateStatusDocumentLockError,
            summary,
            error.to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryRepository;
    use chrono::Duration;

    fn lock(repo: &Arc<InMemoryRepository>) -> RunLock {
        RunLock::new(
            Arc::clone(repo) as Arc<dyn StepRepository>,
            Uuid::new_v4(),
            1800,
        )
    }

    #[tokio::test]
    async fn test_acquire_on_clean_cluster() {
        let repo = Arc::new(InMemoryRepository::new());
        let lock = lock(&repo);

        lock.acquire().await.unwrap();
        let doc = repo.status_document().await.unwrap();
        assert_eq!(doc.run_id, lock.run_id());
        assert_eq!(doc.state, MigrationState::Running);
    }

    #[tokio::test]
    async fn test_second_acquire_is_refused() {
        let repo = Arc::new(InMemoryRepository::new());
        lock(&repo).acquire().await.unwrap();

        let result = lock(&repo).acquire().await.unwrap_err();
        assert_eq!(
            result.status,
            StepExecutionStatus::MigrationAlreadyInProgressError
        );
    }

    #[tokio::test]
    async fn test_stale_lock_is_taken_over() {
        let repo = Arc::new(InMemoryRepository::new());
        let mut abandoned = StatusDocument::new(Uuid::new_v4(), MigrationState::Running);
        abandoned.last_updated_at = Utc::now() - Duration::seconds(3600);
        repo.force_status_document(abandoned).await;

        let lock = lock(&repo);
        lock.acquire().await.unwrap();
        assert_eq!(repo.status_document().await.unwrap().run_id, lock.run_id());
    }

    #[tokio::test]
    async fn test_terminal_document_is_replaced() {
        let repo = Arc::new(InMemoryRepository::new());
        let finished = StatusDocument::new(Uuid::new_v4(), MigrationState::Completed);
        repo.force_status_document(finished).await;

        lock(&repo).acquire().await.unwrap();
        assert_eq!(
            repo.status_document().await.unwrap().state,
            MigrationState::Running
        );
    }

    #[tokio::test]
    async fn test_renew_detects_takeover() {
        let repo = Arc::new(InMemoryRepository::new());
        let lock = lock(&repo);
        lock.acquire().await.unwrap();

        // Another process replaced the document.
        repo.force_status_document(StatusDocument::new(
            Uuid::new_v4(),
            MigrationState::Running,
        ))
        .await;

        let result = lock.renew(MigrationState::Running).await.unwrap_err();
        assert_eq!(
            result.status,
            StepExecutionStatus::CannotUpdateStatusDocumentLockError
        );
    }

    #[tokio::test]
    async fn test_release_records_terminal_state() {
        let repo = Arc::new(InMemoryRepository::new());
        let lock = lock(&repo);
        lock.acquire().await.unwrap();

        lock.release(MigrationState::Completed).await.unwrap();
        assert_eq!(
            repo.status_document().await.unwrap().state,
            MigrationState::Completed
        );
    }
}
