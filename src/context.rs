//! Per-run migration state.
//!
//! One `MigrationContext` is created per run, owned exclusively by the
//! orchestrator and passed by mutable reference to every step. Later steps
//! depend on state populated by earlier ones, so the container enforces the
//! pipeline's write-once / append-only invariants instead of trusting step
//! ordering.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::StepError;

/// Per-index document counters populated during copy and verification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct DocCounters {
    /// Documents the source held when the copy started.
    pub expected: u64,
    /// Documents successfully written to the destination.
    pub copied: u64,
    /// Documents counted in the destination during verification.
    pub verified: u64,
}

/// Mutable state container threaded through the pipeline.
#[derive(Debug)]
pub struct MigrationContext {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    /// Set exactly once by the resolution step, read-only afterwards.
    data_indices: Option<Vec<String>>,
    /// Append-only, except for the explicit rollback/delete path.
    backup_indices: Vec<String>,
    /// External tenant identifier -> internal storage identifier. Injective.
    tenant_map: BTreeMap<String, String>,
    /// Consolidated destination index, registered when created.
    target_index: Option<String>,
    counters: BTreeMap<String, DocCounters>,
}

impl MigrationContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            data_indices: None,
            backup_indices: Vec::new(),
            tenant_map: BTreeMap::new(),
            target_index: None,
            counters: BTreeMap::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Record the resolved data indices. May only be called once.
    pub fn set_data_indices(&mut self, indices: Vec<String>) -> Result<(), StepError> {
        if self.data_indices.is_some() {
            return Err(StepError::ContextInvariant(
                "data indices were already resolved".into(),
            ));
        }
        self.data_indices = Some(indices);
        Ok(())
    }

    /// Resolved data indices; fails if resolution has not run yet.
    pub fn data_indices(&self) -> Result<&[String], StepError> {
        self.data_indices.as_deref().ok_or_else(|| {
            StepError::ContextInvariant("data indices have not been resolved".into())
        })
    }

    pub fn add_backup_index(&mut self, name: String) {
        if !self.backup_indices.contains(&name) {
            self.backup_indices.push(name);
        }
    }

    pub fn backup_indices(&self) -> &[String] {
        &self.backup_indices
    }

    /// Forget backup indices after the rollback/delete step removed them.
    pub fn clear_backup_indices(&mut self) {
        self.backup_indices.clear();
    }

    /// Register a tenant mapping, enforcing injectivity.
    ///
    /// Returns the external tenant already owning `internal` on collision.
    pub fn insert_tenant(&mut self, external: &str, internal: &str) -> Result<(), String> {
        if let Some((owner, _)) = self
            .tenant_map
            .iter()
            .find(|(ext, int)| int.as_str() == internal && ext.as_str() != external)
        {
            return Err(owner.clone());
        }
        self.tenant_map
            .insert(external.to_string(), internal.to_string());
        Ok(())
    }

    pub fn tenant_map(&self) -> &BTreeMap<String, String> {
        &self.tenant_map
    }

    pub fn set_target_index(&mut self, name: String) {
        self.target_index = Some(name);
    }

    pub fn target_index(&self) -> Result<&str, StepError> {
        self.target_index.as_deref().ok_or_else(|| {
            StepError::ContextInvariant("target index has not been created".into())
        })
    }

    /// Guard for steps about to touch `name`: every index referenced after
    /// resolution must have appeared in the data, backup or target sets
    /// first. A miss is a pipeline ordering bug.
    pub fn require_known_index(&self, name: &str) -> Result<(), StepError> {
        let known = self
            .data_indices
            .as_deref()
            .is_some_and(|d| d.iter().any(|i| i == name))
            || self.backup_indices.iter().any(|i| i == name)
            || self.target_index.as_deref() == Some(name);
        if known {
            Ok(())
        } else {
            Err(StepError::ContextInvariant(format!(
                "index '{name}' was never resolved or created by an earlier step"
            )))
        }
    }

    pub fn counters(&self) -> &BTreeMap<String, DocCounters> {
        &self.counters
    }

    pub fn counters_mut(&mut self, index: &str) -> &mut DocCounters {
        self.counters.entry(index.to_string()).or_default()
    }

    /// Sum of expected documents across all counted indices.
    pub fn total_expected(&self) -> u64 {
        self.counters.values().map(|c| c.expected).sum()
    }

    /// Sum of copied documents across all counted indices.
    pub fn total_copied(&self) -> u64 {
        self.counters.values().map(|c| c.copied).sum()
    }
}

impl Default for MigrationContext {
    fn default() -> Self {
        Self::new()
    }
}
