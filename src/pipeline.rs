//! Pipeline assembly and orchestration.
//!
//! The orchestrator owns the run: it acquires the distributed lock, executes
//! the stages in declaration order, renews the lock at every stage boundary
//! and reacts to failures according to their class. Compensable failures
//! trigger a reverse walk over the executed stages' compensations; fatal
//! failures (lock loss, unexpected errors) abort with no cleanup because the
//! pipeline no longer knows what state the cluster is in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::context::MigrationContext;
use crate::lock::RunLock;
use crate::repository::StepRepository;
use crate::status::{StepExecutionStatus, StepResult};
use crate::steps::backup::{CopyToBackupStep, CreateBackupStep, DeleteBackupStep};
use crate::steps::block::{BlockWritesStep, UnblockWritesStep};
use crate::steps::check_blocked::CheckIndicesNotBlockedStep;
use crate::steps::cleanup::{DeleteSourceIndicesStep, RestoreFromBackupStep};
use crate::steps::copy::MigrateDocumentsStep;
use crate::steps::precheck::CheckPreviousBackupStep;
use crate::steps::resolve::ResolveTenantIndicesStep;
use crate::steps::target::{CreateGlobalIndexStep, DeleteGlobalIndexStep};
use crate::steps::verify::{VerifyBackupStep, VerifyMigrationStep};
use crate::steps::MigrationStep;

/// Lifecycle of a run as recorded in the status document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationState {
    NotStarted,
    Running,
    Completed,
    RolledBack,
    Failed,
}

/// One stage of the pipeline: a forward step and, where the step has a
/// durable effect, the step that undoes it.
pub struct PipelineStage {
    step: Box<dyn MigrationStep>,
    compensation: Option<Box<dyn MigrationStep>>,
}

impl PipelineStage {
    pub fn new(step: Box<dyn MigrationStep>) -> Self {
        Self {
            step,
            compensation: None,
        }
    }

    pub fn compensated_by(mut self, compensation: Box<dyn MigrationStep>) -> Self {
        self.compensation = Some(compensation);
        self
    }
}

pub struct Pipeline {
    stages: Vec<PipelineStage>,
}

impl Pipeline {
    pub fn new(stages: Vec<PipelineStage>) -> Self {
        Self { stages }
    }

    /// The standard tenant consolidation pipeline.
    ///
    /// Writes are blocked before the backup is taken so the backup is a
    /// consistent snapshot, and the sources are deleted only after both the
    /// backup and the destination passed count verification.
    pub fn standard(repo: Arc<dyn StepRepository>, config: &Config) -> Self {
        let destination = config.migration.destination_index();
        let batch_size = config.migration.batch_size;
        let r = &repo;

        Self::new(vec![
            PipelineStage::new(Box::new(ResolveTenantIndicesStep::new(
                Arc::clone(r),
                config.migration.tenants.clone(),
                config.migration.global_tenant_alias.clone(),
            ))),
            PipelineStage::new(Box::new(CheckPreviousBackupStep::new(
                Arc::clone(r),
                destination.clone(),
            ))),
            PipelineStage::new(Box::new(CheckIndicesNotBlockedStep::new(Arc::clone(r)))),
            PipelineStage::new(Box::new(BlockWritesStep::new(Arc::clone(r))))
                .compensated_by(Box::new(UnblockWritesStep::new(Arc::clone(r)))),
            PipelineStage::new(Box::new(CreateBackupStep::new(Arc::clone(r))))
                .compensated_by(Box::new(DeleteBackupStep::new(Arc::clone(r)))),
            PipelineStage::new(Box::new(CopyToBackupStep::new(Arc::clone(r), batch_size))),
            PipelineStage::new(Box::new(VerifyBackupStep::new(Arc::clone(r)))),
            PipelineStage::new(Box::new(CreateGlobalIndexStep::new(
                Arc::clone(r),
                destination.clone(),
            )))
            .compensated_by(Box::new(DeleteGlobalIndexStep::new(
                Arc::clone(r),
                destination,
            ))),
            PipelineStage::new(Box::new(MigrateDocumentsStep::new(
                Arc::clone(r),
                &config.migration,
            ))),
            PipelineStage::new(Box::new(VerifyMigrationStep::new(Arc::clone(r)))),
            PipelineStage::new(Box::new(DeleteSourceIndicesStep::new(Arc::clone(r))))
                .compensated_by(Box::new(RestoreFromBackupStep::new(
                    Arc::clone(r),
                    batch_size,
                ))),
            PipelineStage::new(Box::new(UnblockWritesStep::new(Arc::clone(r)))),
        ])
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Outcome of one step or compensation, as reported to the operator.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutedStep {
    pub name: String,
    pub result: StepResult,
}

/// Operator-facing summary of a finished run.
#[derive(Debug, Serialize)]
pub struct MigrationReport {
    pub run_id: Uuid,
    pub state: MigrationState,
    pub status: StepExecutionStatus,
    /// First failure of the run, if any. Present even when a successful
    /// rollback turned the final status into `ROLLBACK`.
    pub failure: Option<StepResult>,
    pub executed: Vec<ExecutedStep>,
    pub compensations: Vec<ExecutedStep>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl MigrationReport {
    pub fn succeeded(&self) -> bool {
        self.state == MigrationState::Completed
    }
}

pub struct Orchestrator {
    repo: Arc<dyn StepRepository>,
    pipeline: Pipeline,
    stale_after_secs: u64,
}

impl Orchestrator {
    pub fn new(repo: Arc<dyn StepRepository>, config: &Config) -> Self {
        let pipeline = Pipeline::standard(Arc::clone(&repo), config);
        Self::with_pipeline(repo, pipeline, config.lock.stale_after_secs)
    }

    /// Run a custom pipeline under the standard lock discipline.
    pub fn with_pipeline(
        repo: Arc<dyn StepRepository>,
        pipeline: Pipeline,
        stale_after_secs: u64,
    ) -> Self {
        Self {
            repo,
            pipeline,
            stale_after_secs,
        }
    }

    pub async fn run(&self) -> MigrationReport {
        let mut ctx = MigrationContext::new();
        let run_id = ctx.run_id();
        let started_at = ctx.started_at();
        let lock = RunLock::new(Arc::clone(&self.repo), run_id, self.stale_after_secs);

        let mut executed: Vec<ExecutedStep> = Vec::new();
        let mut compensations: Vec<ExecutedStep> = Vec::new();

        info!(%run_id, stages = self.pipeline.len(), "starting migration run");

        if let Err(result) = lock.acquire().await {
            error!(%run_id, status = %result.status, "could not acquire migration lock");
            let status = result.status;
            executed.push(ExecutedStep {
                name: "acquire-migration-lock".into(),
                result: result.clone(),
            });
            return MigrationReport {
                run_id,
                state: MigrationState::Failed,
                status,
                failure: Some(result),
                executed,
                compensations,
                started_at,
                finished_at: Utc::now(),
            };
        }

        let mut failure: Option<StepResult> = None;
        let mut failed_stage = 0usize;

        for (idx, stage) in self.pipeline.stages.iter().enumerate() {
            let name = stage.step.name();
            let result = match stage.step.execute(&mut ctx).await {
                Ok(result) => result,
                Err(e) => {
                    error!(step = name, error = %e, "step raised an unexpected error");
                    StepResult::failure(
                        StepExecutionStatus::UnexpectedError,
                        format!("step '{name}' failed unexpectedly"),
                        e.to_string(),
                    )
                }
            };

            let succeeded = result.success();
            if succeeded {
                info!(step = name, status = %result.status, "step completed");
            } else {
                error!(step = name, status = %result.status, summary = %result.summary, "step failed");
            }
            executed.push(ExecutedStep {
                name: name.to_string(),
                result: result.clone(),
            });

            if !succeeded {
                failure = Some(result);
                failed_stage = idx;
                break;
            }

            if let Err(lock_failure) = lock.renew(MigrationState::Running).await {
                error!(status = %lock_failure.status, "lost the migration lock between stages");
                executed.push(ExecutedStep {
                    name: "renew-migration-lock".into(),
                    result: lock_failure.clone(),
                });
                failure = Some(lock_failure);
                failed_stage = idx;
                break;
            }
        }

        let (state, status) = match &failure {
            None => {
                if let Err(release_failure) = lock.release(MigrationState::Completed).await {
                    // The data work is done; a failed terminal write only
                    // degrades what the next run can read from the lock.
                    warn!(status = %release_failure.status, "could not record terminal lock state");
                }
                (MigrationState::Completed, StepExecutionStatus::Ok)
            }
            Some(result) if result.status.is_fatal() => {
                // Ownership of the run is unknown for lock failures; for
                // unexpected errors the cluster state is. Either way no
                // compensation may touch the indices.
                let released = !matches!(
                    result.status,
                    StepExecutionStatus::MigrationAlreadyInProgressError
                        | StepExecutionStatus::CannotCreateStatusDocumentLockError
                        | StepExecutionStatus::CannotUpdateStatusDocumentLockError
                );
                if released {
                    if let Err(release_failure) = lock.release(MigrationState::Failed).await {
                        warn!(status = %release_failure.status, "could not record terminal lock state");
                    }
                }
                (MigrationState::Failed, result.status)
            }
            Some(result) => {
                let (state, status) = self
                    .compensate(&mut ctx, &lock, failed_stage, &mut compensations)
                    .await;
                info!(
                    trigger = %result.status,
                    ?state,
                    compensations = compensations.len(),
                    "rollback finished"
                );
                if let Err(release_failure) = lock.release(state).await {
                    warn!(status = %release_failure.status, "could not record terminal lock state");
                }
                (state, status)
            }
        };

        MigrationReport {
            run_id,
            state,
            status,
            failure,
            executed,
            compensations,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Reverse walk over the executed stages, running each compensation.
    /// The walk is best effort: a failed compensation is recorded and the
    /// walk continues, because the remaining compensations undo unrelated
    /// effects. A lock loss stops it, nothing may run without ownership.
    async fn compensate(
        &self,
        ctx: &mut MigrationContext,
        lock: &RunLock,
        failed_stage: usize,
        compensations: &mut Vec<ExecutedStep>,
    ) -> (MigrationState, StepExecutionStatus) {
        let mut worst: Option<StepExecutionStatus> = None;

        for stage in self.pipeline.stages[..=failed_stage].iter().rev() {
            let Some(comp) = &stage.compensation else {
                continue;
            };
            let name = comp.name();

            let result = match comp.execute(ctx).await {
                Ok(result) => result,
                Err(e) => {
                    error!(compensation = name, error = %e, "compensation raised an unexpected error");
                    StepResult::failure(
                        StepExecutionStatus::UnexpectedError,
                        format!("compensation '{name}' failed unexpectedly"),
                        e.to_string(),
                    )
                }
            };

            if result.success() {
                info!(compensation = name, "compensation completed");
            } else {
                error!(compensation = name, status = %result.status, "compensation failed");
                // An unexpected error outranks taxonomy failures; otherwise
                // the first failure wins.
                if result.status == StepExecutionStatus::UnexpectedError
                    || worst.is_none()
                {
                    worst = Some(result.status);
                }
            }
            compensations.push(ExecutedStep {
                name: name.to_string(),
                result,
            });

            if let Err(lock_failure) = lock.renew(MigrationState::Running).await {
                error!(status = %lock_failure.status, "lost the migration lock during rollback");
                let status = lock_failure.status;
                compensations.push(ExecutedStep {
                    name: "renew-migration-lock".into(),
                    result: lock_failure,
                });
                return (MigrationState::Failed, status);
            }
        }

        match worst {
            None => (MigrationState::RolledBack, StepExecutionStatus::Rollback),
            Some(status) => (MigrationState::Failed, status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StepError;
    use crate::repository::memory::InMemoryRepository;
    use async_trait::async_trait;
    use std::sync::Mutex;

    type CallLog = Arc<Mutex<Vec<&'static str>>>;

    struct ScriptedStep {
        name: &'static str,
        status: StepExecutionStatus,
        log: CallLog,
    }

    #[async_trait]
    impl MigrationStep for ScriptedStep {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn execute(&self, _ctx: &mut MigrationContext) -> Result<StepResult, StepError> {
            self.log.lock().unwrap().push(self.name);
            Ok(StepResult::new(self.status, self.name, ""))
        }
    }

    struct PanickyStep;

    #[async_trait]
    impl MigrationStep for PanickyStep {
        fn name(&self) -> &'static str {
            "faulty"
        }

        async fn execute(&self, _ctx: &mut MigrationContext) -> Result<StepResult, StepError> {
            Err(StepError::ContextInvariant("boom".into()))
        }
    }

    fn scripted(name: &'static str, status: StepExecutionStatus, log: &CallLog) -> Box<ScriptedStep> {
        Box::new(ScriptedStep {
            name,
            status,
            log: Arc::clone(log),
        })
    }

    fn orchestrator(stages: Vec<PipelineStage>) -> (Orchestrator, Arc<InMemoryRepository>) {
        let repo = Arc::new(InMemoryRepository::new());
        let orch = Orchestrator::with_pipeline(
            Arc::clone(&repo) as Arc<dyn StepRepository>,
            Pipeline::new(stages),
            1800,
        );
        (orch, repo)
    }

    #[tokio::test]
    async fn test_all_stages_succeed() {
        let log: CallLog = Arc::default();
        let (orch, repo) = orchestrator(vec![
            PipelineStage::new(scripted("one", StepExecutionStatus::Ok, &log)),
            PipelineStage::new(scripted("two", StepExecutionStatus::Ok, &log)),
        ]);

        let report = orch.run().await;
        assert_eq!(report.state, MigrationState::Completed);
        assert_eq!(report.status, StepExecutionStatus::Ok);
        assert!(report.failure.is_none());
        assert_eq!(report.executed.len(), 2);
        assert!(report.compensations.is_empty());
        assert_eq!(
            repo.status_document().await.unwrap().state,
            MigrationState::Completed
        );
    }

    #[tokio::test]
    async fn test_compensable_failure_walks_compensations_in_reverse() {
        let log: CallLog = Arc::default();
        let (orch, repo) = orchestrator(vec![
            PipelineStage::new(scripted("first", StepExecutionStatus::Ok, &log))
                .compensated_by(scripted("undo-first", StepExecutionStatus::Ok, &log)),
            PipelineStage::new(scripted("second", StepExecutionStatus::Ok, &log))
                .compensated_by(scripted("undo-second", StepExecutionStatus::Ok, &log)),
            PipelineStage::new(scripted(
                "third",
                StepExecutionStatus::DocumentCopyError,
                &log,
            )),
        ]);

        let report = orch.run().await;
        assert_eq!(report.state, MigrationState::RolledBack);
        assert_eq!(report.status, StepExecutionStatus::Rollback);
        assert_eq!(
            report.failure.as_ref().unwrap().status,
            StepExecutionStatus::DocumentCopyError
        );
        assert_eq!(
            *log.lock().unwrap(),
            ["first", "second", "third", "undo-second", "undo-first"]
        );
        assert_eq!(
            repo.status_document().await.unwrap().state,
            MigrationState::RolledBack
        );
    }

    #[tokio::test]
    async fn test_fatal_failure_skips_compensation() {
        let log: CallLog = Arc::default();
        let (orch, repo) = orchestrator(vec![
            PipelineStage::new(scripted("first", StepExecutionStatus::Ok, &log))
                .compensated_by(scripted("undo-first", StepExecutionStatus::Ok, &log)),
            PipelineStage::new(Box::new(PanickyStep)),
        ]);

        let report = orch.run().await;
        assert_eq!(report.state, MigrationState::Failed);
        assert_eq!(report.status, StepExecutionStatus::UnexpectedError);
        assert!(report.compensations.is_empty());
        assert!(!log.lock().unwrap().contains(&"undo-first"));
        assert_eq!(
            repo.status_document().await.unwrap().state,
            MigrationState::Failed
        );
    }

    #[tokio::test]
    async fn test_failed_compensation_turns_run_failed() {
        let log: CallLog = Arc::default();
        let (orch, _repo) = orchestrator(vec![
            PipelineStage::new(scripted("first", StepExecutionStatus::Ok, &log))
                .compensated_by(scripted(
                    "undo-first",
                    StepExecutionStatus::CannotDeleteIndexError,
                    &log,
                )),
            PipelineStage::new(scripted("second", StepExecutionStatus::Ok, &log))
                .compensated_by(scripted("undo-second", StepExecutionStatus::Ok, &log)),
            PipelineStage::new(scripted(
                "third",
                StepExecutionStatus::MissingDocumentsInBackupError,
                &log,
            )),
        ]);

        let report = orch.run().await;
        assert_eq!(report.state, MigrationState::Failed);
        assert_eq!(report.status, StepExecutionStatus::CannotDeleteIndexError);
        // The walk continued past the failed compensation.
        assert_eq!(report.compensations.len(), 2);
    }

    #[tokio::test]
    async fn test_held_lock_refuses_a_second_run() {
        let log: CallLog = Arc::default();
        let (orch, repo) = orchestrator(vec![PipelineStage::new(scripted(
            "only",
            StepExecutionStatus::Ok,
            &log,
        ))]);

        repo.force_status_document(crate::repository::StatusDocument::new(
            Uuid::new_v4(),
            MigrationState::Running,
        ))
        .await;

        let report = orch.run().await;
        assert_eq!(report.state, MigrationState::Failed);
        assert_eq!(
            report.status,
            StepExecutionStatus::MigrationAlreadyInProgressError
        );
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_stage_own_compensation_runs() {
        let log: CallLog = Arc::default();
        let (orch, _repo) = orchestrator(vec![PipelineStage::new(scripted(
            "create",
            StepExecutionStatus::CannotCreateGlobalIndexError,
            &log,
        ))
        .compensated_by(scripted("undo-create", StepExecutionStatus::Ok, &log))]);

        let report = orch.run().await;
        assert_eq!(report.state, MigrationState::RolledBack);
        assert!(log.lock().unwrap().contains(&"undo-create"));
    }
}
