//! Consolidated destination index.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use crate::context::MigrationContext;
use crate::error::StepError;
use crate::repository::{IndexSettings, StepRepository};
use crate::status::{StepExecutionStatus, StepResult};
use crate::steps::MigrationStep;

/// Creates the versioned destination index all tenants are merged into.
pub struct CreateGlobalIndexStep {
    repo: Arc<dyn StepRepository>,
    destination: String,
}

impl CreateGlobalIndexStep {
    pub fn new(repo: Arc<dyn StepRepository>, destination: String) -> Self {
        Self { repo, destination }
    }

    /// Mapping of the consolidated layout: the tenant discriminator is a
    /// keyword field, everything else stays dynamic.
    fn mappings() -> serde_json::Value {
        json!({
            "properties": {
                "tenant": { "type": "keyword" }
            },
            "dynamic": true
        })
    }
}

#[async_trait]
impl MigrationStep for CreateGlobalIndexStep {
    fn name(&self) -> &'static str {
        "create-global-index"
    }

    async fn execute(&self, ctx: &mut MigrationContext) -> Result<StepResult, StepError> {
        if self.repo.index_exists(&self.destination).await? {
            // Resumed run; the precheck already decided this is safe.
            ctx.set_target_index(self.destination.clone());
            return Ok(StepResult::ok(
                format!("destination index {} already exists", self.destination),
                String::new(),
            ));
        }

        if let Err(e) = self
            .repo
            .create_index(&self.destination, &Self::mappings(), &IndexSettings::default())
            .await
        {
            return Ok(StepResult::failure(
                StepExecutionStatus::CannotCreateGlobalIndexError,
                format!("failed to create destination index '{}'", self.destination),
                e.to_string(),
            ));
        }

        info!(index = %self.destination, "destination index created");
        ctx.set_target_index(self.destination.clone());
        Ok(StepResult::ok(
            format!("destination index {} created", self.destination),
            String::new(),
        ))
    }
}

/// Compensation for `create-global-index`: removes the partially filled
/// destination so a later run starts clean.
pub struct DeleteGlobalIndexStep {
    repo: Arc<dyn StepRepository>,
    destination: String,
}

impl DeleteGlobalIndexStep {
    pub fn new(repo: Arc<dyn StepRepository>, destination: String) -> Self {
        Self { repo, destination }
    }
}

#[async_trait]
impl MigrationStep for DeleteGlobalIndexStep {
    fn name(&self) -> &'static str {
        "delete-global-index"
    }

    async fn execute(&self, _ctx: &mut MigrationContext) -> Result<StepResult, StepError> {
        if let Err(e) = self.repo.delete_index(&self.destination).await {
            return Ok(StepResult::failure(
                StepExecutionStatus::CannotDeleteIndexError,
                format!("failed to delete destination index '{}'", self.destination),
                e.to_string(),
            ));
        }
        Ok(StepResult::ok(
            format!("destination index {} deleted", self.destination),
            String::new(),
        ))
    }
}
