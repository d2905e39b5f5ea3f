//! Store access trait and data types.
//!
//! Every pipeline step talks to the search cluster exclusively through
//! [`StepRepository`]. The core never performs store operations itself; the
//! adapters in this module ([`http::HttpRepository`] for a live cluster,
//! [`memory::InMemoryRepository`] for tests) are interchangeable behind the
//! trait.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::RepositoryError;
use crate::pipeline::MigrationState;

/// Lazy sequence of documents produced by a scrolled, sliced read.
pub type DocumentStream = BoxStream<'static, Result<Document, RepositoryError>>;

/// Subset of index settings the pipeline cares about.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexSettings {
    /// Whether the index currently rejects writes.
    #[serde(default)]
    pub write_blocked: bool,
    /// Remaining settings, passed through untouched when recreating indices.
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One stored document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub source: serde_json::Value,
}

/// Per-document outcome of a bulk write.
#[derive(Debug, Clone)]
pub struct BulkItemOutcome {
    pub id: String,
    pub ok: bool,
    /// Store-provided reason when `ok` is false.
    pub reason: Option<String>,
}

/// Write mode for the status document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMode {
    /// Fail with [`RepositoryError::Conflict`] if the document exists.
    CreateIfAbsent,
    /// Unconditionally replace the document.
    Overwrite,
}

/// The singleton cluster-wide migration status record. Doubles as the
/// distributed run lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusDocument {
    pub run_id: Uuid,
    pub state: MigrationState,
    pub started_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl StatusDocument {
    pub fn new(run_id: Uuid, state: MigrationState) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            state,
            started_at: now,
            last_updated_at: now,
        }
    }

    /// Whether a `Running` document is old enough to be considered abandoned.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after_secs: u64) -> bool {
        let age = now.signed_duration_since(self.last_updated_at);
        age.num_seconds() >= stale_after_secs as i64
    }
}

/// Storage and query operations performed by pipeline steps.
///
/// All mutating operations are idempotent where the pipeline relies on it:
/// blocking an already-blocked index, deleting a missing index and unblocking
/// an unblocked index are no-ops, not errors.
#[async_trait]
pub trait StepRepository: Send + Sync {
    /// Current settings per requested index; `None` for missing indices.
    async fn get_settings(
        &self,
        names: &[String],
    ) -> Result<HashMap<String, Option<IndexSettings>>, RepositoryError>;

    /// Set or clear the write block flag on every named index.
    async fn set_write_block(
        &self,
        names: &[String],
        blocked: bool,
    ) -> Result<(), RepositoryError>;

    async fn create_index(
        &self,
        name: &str,
        mappings: &serde_json::Value,
        settings: &IndexSettings,
    ) -> Result<(), RepositoryError>;

    /// Delete an index. Deleting a missing index is a no-op.
    async fn delete_index(&self, name: &str) -> Result<(), RepositoryError>;

    async fn index_exists(&self, name: &str) -> Result<bool, RepositoryError>;

    /// Concrete index names matching a `*` wildcard pattern.
    async fn list_indices(&self, pattern: &str) -> Result<Vec<String>, RepositoryError>;

    /// Resolve an alias to its concrete index name, `None` if unknown.
    async fn resolve_alias(&self, alias: &str) -> Result<Option<String>, RepositoryError>;

    /// Bulk-index documents into `index`, returning one outcome per document.
    async fn bulk_write(
        &self,
        index: &str,
        documents: Vec<Document>,
    ) -> Result<Vec<BulkItemOutcome>, RepositoryError>;

    /// Scrolled read over the slice `slice_id` of `slice_count` disjoint
    /// partitions of `source`.
    async fn scroll_slice(
        &self,
        source: &str,
        slice_id: usize,
        slice_count: usize,
    ) -> Result<DocumentStream, RepositoryError>;

    async fn count(&self, name: &str) -> Result<u64, RepositoryError>;

    async fn get_status_document(&self) -> Result<Option<StatusDocument>, RepositoryError>;

    async fn put_status_document(
        &self,
        doc: &StatusDocument,
        mode: PutMode,
    ) -> Result<(), RepositoryError>;

    async fn delete_status_document(&self) -> Result<(), RepositoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_status_document_staleness() {
        let mut doc = StatusDocument::new(Uuid::new_v4(), MigrationState::Running);
        let now = Utc::now();
        doc.last_updated_at = now - Duration::seconds(10);
        assert!(!doc.is_stale(now, 1800));
        doc.last_updated_at = now - Duration::seconds(1801);
        assert!(doc.is_stale(now, 1800));
    }
}
