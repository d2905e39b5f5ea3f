//! HTTP store adapter.
//!
//! Implements [`StepRepository`] against the search cluster's REST API
//! (Elasticsearch dialect). This is the only module that knows the wire
//! format; everything above it works in terms of the trait types.

use async_trait::async_trait;
use futures_util::stream;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::config::ClusterConfig;
use crate::error::RepositoryError;
use crate::repository::{
    BulkItemOutcome, Document, DocumentStream, IndexSettings, PutMode, StatusDocument,
    StepRepository,
};

const SCROLL_KEEPALIVE: &str = "2m";
const SCROLL_BATCH_SIZE: usize = 1000;

/// Reqwest-backed cluster client.
pub struct HttpRepository {
    client: reqwest::Client,
    base_url: String,
    /// Hidden index holding the singleton status document.
    status_index: String,
    status_id: String,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

#[derive(Debug, Deserialize)]
struct CatIndexRow {
    index: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(rename = "_scroll_id")]
    scroll_id: Option<String>,
    hits: SearchHits,
}

#[derive(Debug, Deserialize)]
struct SearchHits {
    hits: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_source")]
    source: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    items: Vec<HashMap<String, BulkItemResponse>>,
}

#[derive(Debug, Deserialize)]
struct BulkItemResponse {
    #[serde(rename = "_id")]
    id: String,
    status: u16,
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct GetDocResponse {
    found: bool,
    #[serde(rename = "_source")]
    source: Option<StatusDocument>,
}

impl HttpRepository {
    pub fn new(config: &ClusterConfig) -> Result<Self, RepositoryError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("migrator/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| RepositoryError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            status_index: config.status_index.clone(),
            status_id: config.status_document_id.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Settings endpoint for a write-block update over `names`.
    ///
    /// Unblocking tolerates deleted indices: the list routinely mixes live
    /// backups with sources a cleanup step already removed, and a plain
    /// multi-index `_settings` request 404s as a whole if any name is gone,
    /// leaving the live indices blocked. `ignore_unavailable` makes the
    /// cluster skip the missing names instead. Blocking keeps the strict
    /// form so a missing index still surfaces as an error.
    fn settings_path(names: &[String], blocked: bool) -> String {
        let joined = names.join(",");
        if blocked {
            format!("{joined}/_settings")
        } else {
            format!("{joined}/_settings?ignore_unavailable=true")
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, RepositoryError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let code = status.as_u16();
        let body = response.text().await.unwrap_or_default();
        // The cluster reports writes into a blocked index as a
        // cluster_block_exception; surface it as its own variant so the
        // check-if-blocked step can map it instead of propagating.
        if body.contains("cluster_block_exception") || body.contains("index_blocked") {
            return Err(RepositoryError::Blocked {
                index: String::new(),
            });
        }
        match code {
            404 => Err(RepositoryError::NotFound(body)),
            409 => Err(RepositoryError::Conflict(body)),
            _ => Err(RepositoryError::Status { code, body }),
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, RepositoryError> {
        let response = request
            .send()
            .await
            .map_err(|e| RepositoryError::Transport(e.to_string()))?;
        Self::check(response).await
    }

    async fn scroll_page(
        client: reqwest::Client,
        base_url: String,
        scroll_id: String,
    ) -> Result<SearchResponse, RepositoryError> {
        let response = client
            .post(format!("{base_url}/_search/scroll"))
            .json(&json!({ "scroll": SCROLL_KEEPALIVE, "scroll_id": scroll_id }))
            .send()
            .await
            .map_err(|e| RepositoryError::Transport(e.to_string()))?;
        let response = Self::check(response).await?;
        response
            .json::<SearchResponse>()
            .await
            .map_err(|e| RepositoryError::Transport(e.to_string()))
    }
}

#[async_trait]
impl StepRepository for HttpRepository {
    async fn get_settings(
        &self,
        names: &[String],
    ) -> Result<HashMap<String, Option<IndexSettings>>, RepositoryError> {
        let joined = names.join(",");
        let response = self
            .send(self.client.get(self.url(&format!(
                "{joined}/_settings?flat_settings=true&ignore_unavailable=true"
            ))))
            .await?;
        let body: HashMap<String, serde_json::Value> = response
            .json()
            .await
            .map_err(|e| RepositoryError::Transport(e.to_string()))?;

        let mut result = HashMap::new();
        for name in names {
            let settings = body.get(name).map(|entry| {
                let flat = entry
                    .get("settings")
                    .and_then(serde_json::Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                let write_blocked = flat
                    .get("index.blocks.write")
                    .and_then(serde_json::Value::as_str)
                    == Some("true");
                IndexSettings {
                    write_blocked,
                    extra: flat,
                }
            });
            result.insert(name.clone(), settings);
        }
        Ok(result)
    }

    async fn set_write_block(
        &self,
        names: &[String],
        blocked: bool,
    ) -> Result<(), RepositoryError> {
        debug!(indices = %names.join(","), blocked, "updating write block");
        let result = self
            .send(
                self.client
                    .put(self.url(&Self::settings_path(names, blocked)))
                    .json(&json!({ "index.blocks.write": blocked })),
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            // Clearing the block on an index that is already gone is a no-op.
            Err(RepositoryError::NotFound(_)) if !blocked => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn create_index(
        &self,
        name: &str,
        mappings: &serde_json::Value,
        settings: &IndexSettings,
    ) -> Result<(), RepositoryError> {
        let mut settings_body = settings.extra.clone();
        if settings.write_blocked {
            settings_body.insert("index.blocks.write".into(), json!(true));
        }
        self.send(self.client.put(self.url(name)).json(&json!({
            "mappings": mappings,
            "settings": settings_body,
        })))
        .await?;
        Ok(())
    }

    async fn delete_index(&self, name: &str) -> Result<(), RepositoryError> {
        match self.send(self.client.delete(self.url(name))).await {
            Ok(_) => Ok(()),
            Err(RepositoryError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn index_exists(&self, name: &str) -> Result<bool, RepositoryError> {
        match self.send(self.client.head(self.url(name))).await {
            Ok(_) => Ok(true),
            Err(RepositoryError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn list_indices(&self, pattern: &str) -> Result<Vec<String>, RepositoryError> {
        let response = self
            .send(
                self.client
                    .get(self.url(&format!("_cat/indices/{pattern}?format=json"))),
            )
            .await;
        let response = match response {
            Ok(r) => r,
            Err(RepositoryError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let rows: Vec<CatIndexRow> = response
            .json()
            .await
            .map_err(|e| RepositoryError::Transport(e.to_string()))?;
        Ok(rows.into_iter().map(|r| r.index).collect())
    }

    async fn resolve_alias(&self, alias: &str) -> Result<Option<String>, RepositoryError> {
        let response = match self
            .send(self.client.get(self.url(&format!("_alias/{alias}"))))
            .await
        {
            Ok(r) => r,
            Err(RepositoryError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let body: HashMap<String, serde_json::Value> = response
            .json()
            .await
            .map_err(|e| RepositoryError::Transport(e.to_string()))?;
        Ok(body.into_keys().next())
    }

    async fn bulk_write(
        &self,
        index: &str,
        documents: Vec<Document>,
    ) -> Result<Vec<BulkItemOutcome>, RepositoryError> {
        let mut body = String::new();
        for doc in &documents {
            body.push_str(&serde_json::to_string(
                &json!({ "index": { "_id": doc.id } }),
            )?);
            body.push('\n');
            body.push_str(&serde_json::to_string(&doc.source)?);
            body.push('\n');
        }
        let response = self
            .send(
                self.client
                    .post(self.url(&format!("{index}/_bulk")))
                    .header("Content-Type", "application/x-ndjson")
                    .body(body),
            )
            .await?;
        let parsed: BulkResponse = response
            .json()
            .await
            .map_err(|e| RepositoryError::Transport(e.to_string()))?;

        Ok(parsed
            .items
            .into_iter()
            .filter_map(|mut item| item.remove("index"))
            .map(|item| BulkItemOutcome {
                ok: (200..300).contains(&item.status),
                reason: item.error.map(|e| e.to_string()),
                id: item.id,
            })
            .collect())
    }

    async fn scroll_slice(
        &self,
        source: &str,
        slice_id: usize,
        slice_count: usize,
    ) -> Result<DocumentStream, RepositoryError> {
        let mut body = json!({
            "size": SCROLL_BATCH_SIZE,
            "sort": ["_doc"],
            "query": { "match_all": {} },
        });
        if slice_count > 1 {
            body["slice"] = json!({ "id": slice_id, "max": slice_count });
        }
        let response = self
            .send(
                self.client
                    .post(self.url(&format!("{source}/_search?scroll={SCROLL_KEEPALIVE}")))
                    .json(&body),
            )
            .await?;
        let first: SearchResponse = response
            .json()
            .await
            .map_err(|e| RepositoryError::Transport(e.to_string()))?;

        let client = self.client.clone();
        let base_url = self.base_url.clone();

        // Unfold: emit the buffered page, fetch the next one on demand until
        // the cluster returns an empty page.
        struct ScrollState {
            client: reqwest::Client,
            base_url: String,
            scroll_id: Option<String>,
            buffer: std::vec::IntoIter<Document>,
            done: bool,
        }

        let state = ScrollState {
            client,
            base_url,
            scroll_id: first.scroll_id.clone(),
            buffer: first
                .hits
                .hits
                .into_iter()
                .map(|h| Document {
                    id: h.id,
                    source: h.source,
                })
                .collect::<Vec<_>>()
                .into_iter(),
            done: false,
        };

        let stream = stream::unfold(state, |mut state| async move {
            loop {
                if let Some(doc) = state.buffer.next() {
                    return Some((Ok(doc), state));
                }
                if state.done {
                    return None;
                }
                let Some(scroll_id) = state.scroll_id.clone() else {
                    return None;
                };
                match Self::scroll_page(state.client.clone(), state.base_url.clone(), scroll_id)
                    .await
                {
                    Ok(page) => {
                        state.scroll_id = page.scroll_id;
                        let docs: Vec<Document> = page
                            .hits
                            .hits
                            .into_iter()
                            .map(|h| Document {
                                id: h.id,
                                source: h.source,
                            })
                            .collect();
                        if docs.is_empty() {
                            state.done = true;
                            return None;
                        }
                        state.buffer = docs.into_iter();
                    }
                    Err(e) => {
                        state.done = true;
                        return Some((Err(e), state));
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }

    async fn count(&self, name: &str) -> Result<u64, RepositoryError> {
        let response = self
            .send(self.client.get(self.url(&format!("{name}/_count"))))
            .await?;
        let parsed: CountResponse = response
            .json()
            .await
            .map_err(|e| RepositoryError::Transport(e.to_string()))?;
        Ok(parsed.count)
    }

    async fn get_status_document(&self) -> Result<Option<StatusDocument>, RepositoryError> {
        let path = format!("{}/_doc/{}", self.status_index, self.status_id);
        let response = match self.send(self.client.get(self.url(&path))).await {
            Ok(r) => r,
            Err(RepositoryError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let parsed: GetDocResponse = response
            .json()
            .await
            .map_err(|e| RepositoryError::Transport(e.to_string()))?;
        Ok(if parsed.found { parsed.source } else { None })
    }

    async fn put_status_document(
        &self,
        doc: &StatusDocument,
        mode: PutMode,
    ) -> Result<(), RepositoryError> {
        let path = match mode {
            // _create fails with 409 when the document already exists, which
            // is exactly the mutual-exclusion semantics the lock needs.
            PutMode::CreateIfAbsent => {
                format!("{}/_create/{}", self.status_index, self.status_id)
            }
            PutMode::Overwrite => format!("{}/_doc/{}", self.status_index, self.status_id),
        };
        self.send(
            self.client
                .put(self.url(&format!("{path}?refresh=true")))
                .json(doc),
        )
        .await?;
        Ok(())
    }

    async fn delete_status_document(&self) -> Result<(), RepositoryError> {
        let path = format!("{}/_doc/{}", self.status_index, self.status_id);
        match self.send(self.client.delete(self.url(&path))).await {
            Ok(_) => Ok(()),
            Err(RepositoryError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
