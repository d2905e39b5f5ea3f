//! Bulk document copy.
//!
//! `migrate-documents` moves every document from the resolved data indices
//! into the consolidated destination using a sliced, parallel
//! scroll-and-bulk-write strategy. Slices are disjoint partitions of the
//! source, so the workers never touch the same document; each slice is
//! independently retried on transient store failures before it counts as
//! failed.

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::MigrationConfig;
use crate::context::MigrationContext;
use crate::error::{RepositoryError, StepError};
use crate::repository::{Document, StepRepository};
use crate::status::{StepExecutionStatus, StepResult};
use crate::steps::MigrationStep;

/// Copy one slice of `source` into `dest`, optionally rescoping document ids
/// with `id_scope` so documents from different tenants cannot collide in the
/// consolidated index.
pub(crate) async fn copy_slice(
    repo: &dyn StepRepository,
    source: &str,
    dest: &str,
    id_scope: Option<&str>,
    slice_id: usize,
    slice_count: usize,
    batch_size: usize,
) -> Result<u64, RepositoryError> {
    let mut stream = repo.scroll_slice(source, slice_id, slice_count).await?;
    let mut batch: Vec<Document> = Vec::with_capacity(batch_size);
    let mut copied = 0u64;

    while let Some(doc) = stream.next().await {
        let mut doc = doc?;
        if let Some(scope) = id_scope {
            doc.id = format!("{scope}__{}", doc.id);
        }
        batch.push(doc);
        if batch.len() >= batch_size {
            copied += flush(repo, dest, std::mem::take(&mut batch)).await?;
        }
    }
    if !batch.is_empty() {
        copied += flush(repo, dest, batch).await?;
    }
    Ok(copied)
}

/// Single-slice convenience wrapper used by the backup and restore steps.
pub(crate) async fn copy_index(
    repo: &dyn StepRepository,
    source: &str,
    dest: &str,
    id_scope: Option<&str>,
    batch_size: usize,
) -> Result<u64, RepositoryError> {
    copy_slice(repo, source, dest, id_scope, 0, 1, batch_size).await
}

async fn flush(
    repo: &dyn StepRepository,
    dest: &str,
    batch: Vec<Document>,
) -> Result<u64, RepositoryError> {
    let outcomes = repo.bulk_write(dest, batch).await?;
    let written = outcomes.len() as u64;
    let rejected: Vec<_> = outcomes.into_iter().filter(|o| !o.ok).collect();
    if let Some(first) = rejected.first() {
        return Err(RepositoryError::Status {
            code: 500,
            body: format!(
                "{} bulk items rejected, first id '{}': {}",
                rejected.len(),
                first.id,
                first.reason.as_deref().unwrap_or("unknown reason")
            ),
        });
    }
    Ok(written)
}

pub struct MigrateDocumentsStep {
    repo: Arc<dyn StepRepository>,
    slice_count: usize,
    batch_size: usize,
    retry_attempts: usize,
    retry_min_delay: Duration,
    retry_max_delay: Duration,
}

impl MigrateDocumentsStep {
    pub fn new(repo: Arc<dyn StepRepository>, config: &MigrationConfig) -> Self {
        Self {
            repo,
            slice_count: config.effective_slice_count(),
            batch_size: config.batch_size,
            retry_attempts: config.retry_attempts,
            retry_min_delay: Duration::from_millis(config.retry_min_delay_ms),
            retry_max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    fn retry_strategy(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.retry_min_delay)
            .with_max_delay(self.retry_max_delay)
            .with_max_times(self.retry_attempts)
    }
}

#[async_trait]
impl MigrationStep for MigrateDocumentsStep {
    fn name(&self) -> &'static str {
        "migrate-documents"
    }

    async fn execute(&self, ctx: &mut MigrationContext) -> Result<StepResult, StepError> {
        let target = ctx.target_index()?.to_string();
        let sources = ctx.data_indices()?.to_vec();

        for source in &sources {
            let expected = self.repo.count(source).await?;
            let counters = ctx.counters_mut(source);
            counters.expected = expected;
            // The backup copy used the same counter; this step owns it now.
            counters.copied = 0;
        }

        let semaphore = Arc::new(Semaphore::new(self.slice_count));
        let strategy = self.retry_strategy();
        let mut tasks: JoinSet<(String, usize, Result<u64, RepositoryError>)> = JoinSet::new();

        for source in &sources {
            for slice_id in 0..self.slice_count {
                let repo = Arc::clone(&self.repo);
                let semaphore = Arc::clone(&semaphore);
                let source = source.clone();
                let target = target.clone();
                let batch_size = self.batch_size;
                let slice_count = self.slice_count;

                tasks.spawn(async move {
                    // Bounded worker pool; a permit per in-flight slice. The
                    // semaphore is never closed, acquisition cannot fail.
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        let err = RepositoryError::Transport("worker pool closed".into());
                        return (source, slice_id, Err(err));
                    };

                    let op = || {
                        let repo = Arc::clone(&repo);
                        let source = source.clone();
                        let target = target.clone();
                        async move {
                            copy_slice(
                                repo.as_ref(),
                                &source,
                                &target,
                                Some(&source),
                                slice_id,
                                slice_count,
                                batch_size,
                            )
                            .await
                        }
                    };

                    let outcome = op
                        .retry(strategy)
                        .when(RepositoryError::is_transient)
                        .notify(|err, dur| {
                            warn!(%err, after = ?dur, "retrying copy slice");
                        })
                        .await;

                    (source, slice_id, outcome)
                });
            }
        }

        let total_slices = sources.len() * self.slice_count;
        let mut failed = 0usize;
        let mut details = Vec::new();

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((source, slice_id, Ok(copied))) => {
                    debug!(%source, slice_id, copied, "slice copied");
                    ctx.counters_mut(&source).copied += copied;
                }
                Ok((source, slice_id, Err(e))) => {
                    failed += 1;
                    details.push(format!("{source} slice {slice_id}: {e}"));
                }
                Err(join_err) => {
                    failed += 1;
                    details.push(format!("copy worker crashed: {join_err}"));
                }
            }
        }

        let copied_total = ctx.total_copied();
        info!(copied_total, failed, total_slices, "document copy finished");

        if failed == 0 {
            Ok(StepResult::ok(
                format!("{copied_total} documents copied to {target}"),
                format!("{total_slices} slices completed"),
            ))
        } else if failed == total_slices {
            Ok(StepResult::failure(
                StepExecutionStatus::DocumentCopyError,
                "all copy slices failed",
                details.join("\n"),
            ))
        } else {
            // Partial result is preserved in the context counters so an
            // operator (or a resumed run) can see how far the copy got.
            Ok(StepResult::failure(
                StepExecutionStatus::SlicePartialError,
                format!(
                    "{failed} of {total_slices} copy slices failed after retries, {copied_total} documents copied"
                ),
                details.join("\n"),
            ))
        }
    }
}
