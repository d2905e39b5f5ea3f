//! Point-in-time backups.
//!
//! Backup indices are named deterministically from the source index and the
//! run's start timestamp: `backup_<source>_<yyyyMMddHHmmss>`. The shape is
//! validated before any backup name is used, both for names this run mints
//! and for leftovers found in the cluster.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::{info, warn};

use crate::context::MigrationContext;
use crate::error::StepError;
use crate::repository::{IndexSettings, StepRepository};
use crate::status::{StepExecutionStatus, StepResult};
use crate::steps::copy::copy_index;
use crate::steps::MigrationStep;

pub const BACKUP_PREFIX: &str = "backup_";
const BACKUP_DATE_FORMAT: &str = "%Y%m%d%H%M%S";

static BACKUP_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^backup_(?P<source>.+)_(?P<date>\d{14})$").expect("valid regex"));

/// Deterministic backup name for `source` taken at `at`.
pub fn backup_index_name(source: &str, at: DateTime<Utc>) -> String {
    format!("{BACKUP_PREFIX}{source}_{}", at.format(BACKUP_DATE_FORMAT))
}

/// Validate the shape of a backup index name.
///
/// Returns the source index the backup was taken from.
pub fn validate_backup_name(name: &str) -> Result<&str, StepExecutionStatus> {
    let Some(captures) = BACKUP_NAME_RE.captures(name) else {
        return Err(StepExecutionStatus::InvalidBackupIndexNameError);
    };
    let date = captures.name("date").map_or("", |m| m.as_str());
    if NaiveDateTime::parse_from_str(date, BACKUP_DATE_FORMAT).is_err() {
        return Err(StepExecutionStatus::InvalidDateInBackupIndexNameError);
    }
    Ok(captures
        .name("source")
        .map(|m| m.as_str())
        .unwrap_or_default())
}

/// Backup index registered for `source` in the context, if any.
fn backup_for<'a>(ctx: &'a MigrationContext, source: &str) -> Option<&'a str> {
    ctx.backup_indices()
        .iter()
        .map(String::as_str)
        .find(|b| validate_backup_name(b) == Ok(source))
}

pub struct CreateBackupStep {
    repo: Arc<dyn StepRepository>,
}

impl CreateBackupStep {
    pub fn new(repo: Arc<dyn StepRepository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl MigrationStep for CreateBackupStep {
    fn name(&self) -> &'static str {
        "create-backup"
    }

    async fn execute(&self, ctx: &mut MigrationContext) -> Result<StepResult, StepError> {
        let sources = ctx.data_indices()?.to_vec();
        let started_at = ctx.started_at();
        let mut details = Vec::new();

        for source in &sources {
            // A leftover backup registered by the precheck is reused so a
            // resumed run does not stack a second copy next to it.
            if let Some(existing) = backup_for(ctx, source) {
                details.push(format!("{source}: reusing {existing}"));
                continue;
            }

            let name = backup_index_name(source, started_at);
            if let Err(status) = validate_backup_name(&name) {
                return Ok(StepResult::failure(
                    status,
                    "generated backup name is invalid",
                    name,
                ));
            }

            if self.repo.index_exists(&name).await? {
                details.push(format!("{source}: {name} already exists"));
            } else if let Err(e) = self
                .repo
                .create_index(&name, &serde_json::json!({}), &IndexSettings::default())
                .await
            {
                return Ok(StepResult::failure(
                    StepExecutionStatus::CannotCreateBackupIndexError,
                    format!("failed to create backup index for '{source}'"),
                    e.to_string(),
                ));
            } else {
                details.push(format!("{source}: created {name}"));
            }
            ctx.add_backup_index(name);
        }

        info!(count = ctx.backup_indices().len(), "backup indices ready");
        Ok(StepResult::ok(
            format!("{} backup indices ready", ctx.backup_indices().len()),
            details.join("\n"),
        ))
    }
}

pub struct CopyToBackupStep {
    repo: Arc<dyn StepRepository>,
    batch_size: usize,
}

impl CopyToBackupStep {
    pub fn new(repo: Arc<dyn StepRepository>, batch_size: usize) -> Self {
        Self { repo, batch_size }
    }
}

#[async_trait]
impl MigrationStep for CopyToBackupStep {
    fn name(&self) -> &'static str {
        "copy-to-backup"
    }

    async fn execute(&self, ctx: &mut MigrationContext) -> Result<StepResult, StepError> {
        let sources = ctx.data_indices()?.to_vec();
        let mut details = Vec::new();

        for source in &sources {
            let backup = backup_for(ctx, source)
                .ok_or_else(|| {
                    StepError::ContextInvariant(format!("no backup registered for '{source}'"))
                })?
                .to_string();
            ctx.require_known_index(&backup)?;

            let expected = self.repo.count(source).await?;
            let already = self.repo.count(&backup).await?;
            if already == expected && expected > 0 {
                // Resumed run; the backup is complete.
                details.push(format!("{source}: backup already holds {expected} docs"));
                ctx.counters_mut(source).expected = expected;
                ctx.counters_mut(source).copied = already;
                continue;
            }

            match copy_index(self.repo.as_ref(), source, &backup, None, self.batch_size).await {
                Ok(copied) => {
                    details.push(format!("{source}: {copied} docs copied to {backup}"));
                    ctx.counters_mut(source).expected = expected;
                    ctx.counters_mut(source).copied = copied;
                }
                Err(e) => {
                    return Ok(StepResult::failure(
                        StepExecutionStatus::DocumentCopyError,
                        format!("backup copy failed for '{source}'"),
                        e.to_string(),
                    ));
                }
            }
        }

        Ok(StepResult::ok(
            format!("{} indices backed up", sources.len()),
            details.join("\n"),
        ))
    }
}

/// Compensation for `create-backup`: removes every backup index this run
/// registered. Deleting an already-deleted backup is a no-op.
pub struct DeleteBackupStep {
    repo: Arc<dyn StepRepository>,
}

impl DeleteBackupStep {
    pub fn new(repo: Arc<dyn StepRepository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl MigrationStep for DeleteBackupStep {
    fn name(&self) -> &'static str {
        "delete-backup"
    }

    async fn execute(&self, ctx: &mut MigrationContext) -> Result<StepResult, StepError> {
        let backups = ctx.backup_indices().to_vec();
        for backup in &backups {
            if let Err(e) = self.repo.delete_index(backup).await {
                warn!(index = %backup, error = %e, "failed to delete backup index");
                return Ok(StepResult::failure(
                    StepExecutionStatus::CannotDeleteIndexError,
                    format!("failed to delete backup index '{backup}'"),
                    e.to_string(),
                ));
            }
        }
        ctx.clear_backup_indices();
        Ok(StepResult::ok(
            format!("{} backup indices deleted", backups.len()),
            backups.join("\n"),
        ))
    }
}
