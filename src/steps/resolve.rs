//! Tenant resolution.
//!
//! Turns the configured external tenant names into concrete index names and
//! populates the context's tenant map and data index list. Nothing before
//! this step may touch an index; nearly everything after it reads the list
//! it produces.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::info;

use crate::context::MigrationContext;
use crate::error::StepError;
use crate::repository::StepRepository;
use crate::status::{StepExecutionStatus, StepResult};
use crate::steps::MigrationStep;

/// Derive the internal storage identifier of an external tenant name.
///
/// The external name is normalized (trimmed, lowercased) and content-hashed
/// so arbitrary tenant names become valid, stable index names. Two external
/// names that normalize identically collide; that is the tenant-conflict
/// case the pipeline must refuse.
pub fn internal_tenant_index(external: &str) -> String {
    let normalized = external.trim().to_lowercase();
    let digest = Sha256::digest(normalized.as_bytes());
    format!("tenants_{}", &hex::encode(digest)[..16])
}

pub struct ResolveTenantIndicesStep {
    repo: Arc<dyn StepRepository>,
    tenants: Vec<String>,
    global_alias: String,
}

impl ResolveTenantIndicesStep {
    pub fn new(repo: Arc<dyn StepRepository>, tenants: Vec<String>, global_alias: String) -> Self {
        Self {
            repo,
            tenants,
            global_alias,
        }
    }
}

#[async_trait]
impl MigrationStep for ResolveTenantIndicesStep {
    fn name(&self) -> &'static str {
        "resolve-tenant-indices"
    }

    async fn execute(&self, ctx: &mut MigrationContext) -> Result<StepResult, StepError> {
        let mut details = Vec::new();
        let mut indices = Vec::new();

        // The global tenant index is mandatory and goes first.
        match self.repo.resolve_alias(&self.global_alias).await? {
            Some(concrete) => {
                details.push(format!("{} -> {} (global)", self.global_alias, concrete));
                indices.push(concrete);
            }
            None => {
                return Ok(StepResult::failure(
                    StepExecutionStatus::GlobalTenantNotFoundError,
                    "global tenant index not found",
                    format!("alias '{}' does not resolve to any index", self.global_alias),
                ));
            }
        }

        for tenant in &self.tenants {
            let internal = internal_tenant_index(tenant);
            if let Err(owner) = ctx.insert_tenant(tenant, &internal) {
                return Ok(StepResult::failure(
                    StepExecutionStatus::TenantIndexNameConflictError,
                    "conflicting tenant names",
                    format!(
                        "tenant '{tenant}' maps to internal name '{internal}' already owned by tenant '{owner}'"
                    ),
                ));
            }
            match self.repo.resolve_alias(&internal).await? {
                Some(concrete) => {
                    details.push(format!("{tenant} -> {concrete}"));
                    if !indices.contains(&concrete) {
                        indices.push(concrete);
                    }
                }
                None => {
                    return Ok(StepResult::failure(
                        StepExecutionStatus::CannotResolveIndexByAliasError,
                        "cannot resolve tenant index by alias",
                        format!("alias '{internal}' for tenant '{tenant}' does not resolve to any index"),
                    ));
                }
            }
        }

        info!(count = indices.len(), "resolved data indices");
        let count = indices.len();
        ctx.set_data_indices(indices)?;

        Ok(StepResult::ok(
            format!("{count} data indices resolved"),
            details.join("\n"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryRepository;

    async fn repo_with_tenants(tenants: &[&str]) -> Arc<InMemoryRepository> {
        let repo = Arc::new(InMemoryRepository::new());
        repo.seed_index("global_tenant_idx", 3).await;
        repo.seed_alias("global_tenant", "global_tenant_idx").await;
        for tenant in tenants {
            let internal = internal_tenant_index(tenant);
            repo.seed_index(&format!("{internal}_data"), 2).await;
            repo.seed_alias(&internal, &format!("{internal}_data"))
                .await;
        }
        repo
    }

    #[test]
    fn test_internal_name_is_stable_and_normalized() {
        assert_eq!(
            internal_tenant_index("Marketing"),
            internal_tenant_index("  marketing ")
        );
        assert!(internal_tenant_index("marketing").starts_with("tenants_"));
        assert_ne!(
            internal_tenant_index("marketing"),
            internal_tenant_index("sales")
        );
    }

    #[tokio::test]
    async fn test_resolves_global_first_then_tenants() {
        let repo = repo_with_tenants(&["alpha", "beta"]).await;
        let step = ResolveTenantIndicesStep::new(
            repo,
            vec!["alpha".into(), "beta".into()],
            "global_tenant".into(),
        );
        let mut ctx = MigrationContext::new();

        let result = step.execute(&mut ctx).await.unwrap();
        assert_eq!(result.status, StepExecutionStatus::Ok);
        let indices = ctx.data_indices().unwrap();
        assert_eq!(indices.len(), 3);
        assert_eq!(indices[0], "global_tenant_idx");
        assert_eq!(ctx.tenant_map().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_global_tenant() {
        let repo = Arc::new(InMemoryRepository::new());
        let step = ResolveTenantIndicesStep::new(repo, vec![], "global_tenant".into());
        let mut ctx = MigrationContext::new();

        let result = step.execute(&mut ctx).await.unwrap();
        assert_eq!(result.status, StepExecutionStatus::GlobalTenantNotFoundError);
    }

    #[tokio::test]
    async fn test_unresolvable_tenant_alias() {
        let repo = repo_with_tenants(&["alpha"]).await;
        let step = ResolveTenantIndicesStep::new(
            repo,
            vec!["alpha".into(), "ghost".into()],
            "global_tenant".into(),
        );
        let mut ctx = MigrationContext::new();

        let result = step.execute(&mut ctx).await.unwrap();
        assert_eq!(
            result.status,
            StepExecutionStatus::CannotResolveIndexByAliasError
        );
        assert!(result.details.contains("ghost"));
    }

    #[tokio::test]
    async fn test_colliding_tenant_names_conflict() {
        // "Sales" and "sales " normalize to the same internal name.
        let repo = repo_with_tenants(&["sales"]).await;
        let step = ResolveTenantIndicesStep::new(
            repo,
            vec!["sales".into(), "Sales ".into()],
            "global_tenant".into(),
        );
        let mut ctx = MigrationContext::new();

        let result = step.execute(&mut ctx).await.unwrap();
        assert_eq!(
            result.status,
            StepExecutionStatus::TenantIndexNameConflictError
        );
        // Nothing was resolved, so no later step can block anything.
        assert!(ctx.data_indices().is_err());
    }
}
