//! In-memory store adapter.
//!
//! Backs the test suite: a faithful, single-process implementation of
//! [`StepRepository`] with scripted fault injection so tests can drive the
//! pipeline through partial failures without a live cluster.

use async_trait::async_trait;
use futures_util::stream;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::RepositoryError;
use crate::repository::{
    BulkItemOutcome, Document, DocumentStream, IndexSettings, PutMode, StatusDocument,
    StepRepository,
};

#[derive(Debug, Default, Clone)]
struct IndexEntry {
    write_blocked: bool,
    mappings: serde_json::Value,
    docs: BTreeMap<String, serde_json::Value>,
}

/// Scripted faults. Counters decrement on each triggered failure, so a value
/// of `u32::MAX` is effectively permanent.
#[derive(Debug, Default)]
struct Faults {
    /// Remaining scroll failures per (source index, slice id).
    scroll: HashMap<(String, usize), u32>,
    /// Remaining bulk-write failures per destination index.
    bulk: HashMap<String, u32>,
    /// Index names whose creation fails.
    create: HashSet<String>,
    /// Fixed count responses overriding the real document count.
    count_overrides: HashMap<String, u64>,
}

#[derive(Debug, Default)]
struct Inner {
    indices: BTreeMap<String, IndexEntry>,
    aliases: BTreeMap<String, String>,
    status: Option<StatusDocument>,
    faults: Faults,
}

/// In-memory [`StepRepository`] with fault injection.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an index pre-filled with `count` generated documents.
    pub async fn seed_index(&self, name: &str, count: usize) {
        let mut inner = self.inner.lock().await;
        let entry = inner.indices.entry(name.to_string()).or_default();
        for i in 0..count {
            entry.docs.insert(
                format!("doc-{i:05}"),
                serde_json::json!({ "seq": i, "origin": name }),
            );
        }
    }

    /// Register an alias pointing at a concrete index.
    pub async fn seed_alias(&self, alias: &str, index: &str) {
        let mut inner = self.inner.lock().await;
        inner.aliases.insert(alias.to_string(), index.to_string());
    }

    pub async fn set_blocked(&self, name: &str, blocked: bool) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.indices.get_mut(name) {
            entry.write_blocked = blocked;
        }
    }

    pub async fn is_blocked(&self, name: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.indices.get(name).is_some_and(|e| e.write_blocked)
    }

    pub async fn doc_count(&self, name: &str) -> usize {
        let inner = self.inner.lock().await;
        inner.indices.get(name).map_or(0, |e| e.docs.len())
    }

    pub async fn has_index(&self, name: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.indices.contains_key(name)
    }

    /// Fail the next `times` scrolled reads of `slice_id` over `source`.
    pub async fn fail_scroll_slice(&self, source: &str, slice_id: usize, times: u32) {
        let mut inner = self.inner.lock().await;
        inner
            .faults
            .scroll
            .insert((source.to_string(), slice_id), times);
    }

    /// Fail the next `times` bulk writes into `index`.
    pub async fn fail_bulk(&self, index: &str, times: u32) {
        let mut inner = self.inner.lock().await;
        inner.faults.bulk.insert(index.to_string(), times);
    }

    /// Make creation of `name` fail.
    pub async fn fail_create(&self, name: &str) {
        let mut inner = self.inner.lock().await;
        inner.faults.create.insert(name.to_string());
    }

    /// Pin the reported document count of `name`, regardless of content.
    pub async fn override_count(&self, name: &str, count: u64) {
        let mut inner = self.inner.lock().await;
        inner
            .faults
            .count_overrides
            .insert(name.to_string(), count);
    }

    pub async fn status_document(&self) -> Option<StatusDocument> {
        self.inner.lock().await.status.clone()
    }

    pub async fn force_status_document(&self, doc: StatusDocument) {
        self.inner.lock().await.status = Some(doc);
    }

    fn take_fault(counter: Option<&mut u32>) -> bool {
        match counter {
            Some(remaining) if *remaining > 0 => {
                *remaining = remaining.saturating_sub(1);
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl StepRepository for InMemoryRepository {
    async fn get_settings(
        &self,
        names: &[String],
    ) -> Result<HashMap<String, Option<IndexSettings>>, RepositoryError> {
        let inner = self.inner.lock().await;
        Ok(names
            .iter()
            .map(|name| {
                let settings = inner.indices.get(name).map(|e| IndexSettings {
                    write_blocked: e.write_blocked,
                    extra: serde_json::Map::new(),
                });
                (name.clone(), settings)
            })
            .collect())
    }

    async fn set_write_block(
        &self,
        names: &[String],
        blocked: bool,
    ) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock().await;
        for name in names {
            match inner.indices.get_mut(name) {
                Some(entry) => entry.write_blocked = blocked,
                // Clearing the block on a missing index is a no-op.
                None if !blocked => continue,
                None => return Err(RepositoryError::NotFound(name.clone())),
            }
        }
        Ok(())
    }

    async fn create_index(
        &self,
        name: &str,
        mappings: &serde_json::Value,
        settings: &IndexSettings,
    ) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock().await;
        if inner.faults.create.contains(name) {
            return Err(RepositoryError::Status {
                code: 500,
                body: format!("injected create failure for '{name}'"),
            });
        }
        if inner.indices.contains_key(name) {
            return Err(RepositoryError::Conflict(format!(
                "index '{name}' already exists"
            )));
        }
        inner.indices.insert(
            name.to_string(),
            IndexEntry {
                write_blocked: settings.write_blocked,
                mappings: mappings.clone(),
                docs: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn delete_index(&self, name: &str) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock().await;
        inner.indices.remove(name);
        Ok(())
    }

    async fn index_exists(&self, name: &str) -> Result<bool, RepositoryError> {
        let inner = self.inner.lock().await;
        Ok(inner.indices.contains_key(name))
    }

    async fn list_indices(&self, pattern: &str) -> Result<Vec<String>, RepositoryError> {
        let inner = self.inner.lock().await;
        let matches: Vec<String> = match pattern.strip_suffix('*') {
            Some(prefix) => inner
                .indices
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect(),
            None => inner
                .indices
                .keys()
                .filter(|k| k.as_str() == pattern)
                .cloned()
                .collect(),
        };
        Ok(matches)
    }

    async fn resolve_alias(&self, alias: &str) -> Result<Option<String>, RepositoryError> {
        let inner = self.inner.lock().await;
        Ok(inner.aliases.get(alias).cloned())
    }

    async fn bulk_write(
        &self,
        index: &str,
        documents: Vec<Document>,
    ) -> Result<Vec<BulkItemOutcome>, RepositoryError> {
        let mut inner = self.inner.lock().await;
        if Self::take_fault(inner.faults.bulk.get_mut(index)) {
            return Err(RepositoryError::Transport(format!(
                "injected bulk failure for '{index}'"
            )));
        }
        let entry = inner
            .indices
            .get_mut(index)
            .ok_or_else(|| RepositoryError::NotFound(index.to_string()))?;
        if entry.write_blocked {
            return Err(RepositoryError::Blocked {
                index: index.to_string(),
            });
        }
        Ok(documents
            .into_iter()
            .map(|doc| {
                entry.docs.insert(doc.id.clone(), doc.source);
                BulkItemOutcome {
                    id: doc.id,
                    ok: true,
                    reason: None,
                }
            })
            .collect())
    }

    async fn scroll_slice(
        &self,
        source: &str,
        slice_id: usize,
        slice_count: usize,
    ) -> Result<DocumentStream, RepositoryError> {
        let mut inner = self.inner.lock().await;
        let key = (source.to_string(), slice_id);
        if Self::take_fault(inner.faults.scroll.get_mut(&key)) {
            return Err(RepositoryError::Transport(format!(
                "injected scroll failure for '{source}' slice {slice_id}"
            )));
        }
        let entry = inner
            .indices
            .get(source)
            .ok_or_else(|| RepositoryError::NotFound(source.to_string()))?;
        // Deterministic disjoint partition: position in id order mod slice count.
        let docs: Vec<Document> = entry
            .docs
            .iter()
            .enumerate()
            .filter(|(pos, _)| pos % slice_count == slice_id)
            .map(|(_, (id, source))| Document {
                id: id.clone(),
                source: source.clone(),
            })
            .collect();
        Ok(Box::pin(stream::iter(docs.into_iter().map(Ok))))
    }

    async fn count(&self, name: &str) -> Result<u64, RepositoryError> {
        let inner = self.inner.lock().await;
        if let Some(count) = inner.faults.count_overrides.get(name) {
            return Ok(*count);
        }
        let entry = inner
            .indices
            .get(name)
            .ok_or_else(|| RepositoryError::NotFound(name.to_string()))?;
        Ok(entry.docs.len() as u64)
    }

    async fn get_status_document(&self) -> Result<Option<StatusDocument>, RepositoryError> {
        Ok(self.inner.lock().await.status.clone())
    }

    async fn put_status_document(
        &self,
        doc: &StatusDocument,
        mode: PutMode,
    ) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock().await;
        if mode == PutMode::CreateIfAbsent && inner.status.is_some() {
            return Err(RepositoryError::Conflict(
                "status document already exists".into(),
            ));
        }
        inner.status = Some(doc.clone());
        Ok(())
    }

    async fn delete_status_document(&self) -> Result<(), RepositoryError> {
        self.inner.lock().await.status = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::MigrationState;
    use futures_util::StreamExt;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_slices_partition_disjointly() {
        let repo = InMemoryRepository::new();
        repo.seed_index("src", 10).await;

        let mut seen = Vec::new();
        for slice_id in 0..3 {
            let mut stream = repo.scroll_slice("src", slice_id, 3).await.unwrap();
            while let Some(doc) = stream.next().await {
                seen.push(doc.unwrap().id);
            }
        }
        seen.sort();
        assert_eq!(seen.len(), 10);
        seen.dedup();
        assert_eq!(seen.len(), 10, "slices must not overlap");
    }

    #[tokio::test]
    async fn test_bulk_write_respects_block() {
        let repo = InMemoryRepository::new();
        repo.seed_index("idx", 0).await;
        repo.set_blocked("idx", true).await;

        let docs = vec![Document {
            id: "d1".into(),
            source: serde_json::json!({}),
        }];
        let err = repo.bulk_write("idx", docs).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Blocked { .. }));
    }

    #[tokio::test]
    async fn test_scroll_fault_decrements() {
        let repo = InMemoryRepository::new();
        repo.seed_index("src", 4).await;
        repo.fail_scroll_slice("src", 0, 1).await;

        assert!(repo.scroll_slice("src", 0, 2).await.is_err());
        assert!(repo.scroll_slice("src", 0, 2).await.is_ok());
    }

    #[tokio::test]
    async fn test_create_if_absent_conflicts() {
        let repo = InMemoryRepository::new();
        let doc = StatusDocument::new(Uuid::new_v4(), MigrationState::Running);
        repo.put_status_document(&doc, PutMode::CreateIfAbsent)
            .await
            .unwrap();
        let err = repo
            .put_status_document(&doc, PutMode::CreateIfAbsent)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
        repo.put_status_document(&doc, PutMode::Overwrite)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unblock_missing_index_is_noop() {
        let repo = InMemoryRepository::new();
        repo.set_write_block(&["ghost".to_string()], false)
            .await
            .unwrap();
        let err = repo
            .set_write_block(&["ghost".to_string()], true)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound(_)));
    }
}
