//! Remote REST vector database backend.
//!
//! Speaks a minimal points API (`upsert` / `search` / filtered `delete`)
//! against an external vector store. Vector-only: the server is not asked
//! for keyword or hybrid modes, so the capability set stays `{vector}` and
//! retrieval providers fall back accordingly.
//!
//! The server rejects hyphens in collection identifiers, so names pass
//! through a [`NameMap`](crate::sanitize::NameMap); callers keep using raw
//! UUIDs.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use relaybot_types::error::{RelayError, Result};

use crate::database::{validate_batch, Capability, VdbSearchResults, VectorDatabase};
use crate::sanitize::NameMap;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// REST-backed vector store client.
#[derive(Debug)]
pub struct RemoteVectorDatabase {
    endpoint: String,
    http: reqwest::Client,
    names: NameMap,
}

impl RemoteVectorDatabase {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            http,
            names: NameMap::new(),
        }
    }

    /// Build from the named-entry config shape (`endpoint` key required).
    pub fn from_settings(settings: &serde_json::Map<String, serde_json::Value>) -> Result<Self> {
        let endpoint = settings
            .get("endpoint")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RelayError::ConfigInvalid {
                reason: "remote vdb requires an 'endpoint' setting".into(),
            })?;
        Ok(Self::new(endpoint))
    }

    fn collection_url(&self, safe_name: &str) -> String {
        format!("{}/collections/{safe_name}", self.endpoint)
    }

    fn store_err(&self, message: impl std::fmt::Display) -> RelayError {
        RelayError::VectorStore {
            provider: self.name().into(),
            message: message.to_string(),
        }
    }

    async fn expect_ok(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(self.store_err(format!("server returned {status}: {body}")))
    }
}

#[derive(Deserialize)]
struct RemoteSearchResponse {
    hits: Vec<RemoteHit>,
}

#[derive(Deserialize)]
struct RemoteHit {
    id: String,
    distance: f32,
    #[serde(default)]
    metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    document: Option<String>,
}

#[async_trait]
impl VectorDatabase for RemoteVectorDatabase {
    fn name(&self) -> &str {
        "remote"
    }

    fn get_capabilities(&self) -> HashSet<Capability> {
        [Capability::Vector].into_iter().collect()
    }

    async fn get_or_create_collection(&self, collection: &str) -> Result<()> {
        let safe = self.names.safe(collection);
        let response = self
            .http
            .put(self.collection_url(&safe))
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| self.store_err(e))?;
        // 409 means the collection already exists: idempotent by contract.
        if response.status().as_u16() == 409 {
            return Ok(());
        }
        self.expect_ok(response).await.map(|_| ())
    }

    async fn add_embeddings(
        &self,
        collection: &str,
        ids: &[String],
        vectors: &[Vec<f32>],
        metadatas: &[serde_json::Map<String, serde_json::Value>],
        documents: Option<&[String]>,
    ) -> Result<()> {
        validate_batch(self.name(), ids, vectors, metadatas, None)?;
        let safe = self.names.safe(collection);

        let points: Vec<serde_json::Value> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                serde_json::json!({
                    "id": id,
                    "vector": vectors[i],
                    "metadata": metadatas[i],
                    "document": documents.map(|d| d[i].as_str()),
                })
            })
            .collect();

        debug!(collection = %safe, points = points.len(), "remote upsert");
        let response = self
            .http
            .post(format!("{}/points", self.collection_url(&safe)))
            .json(&serde_json::json!({"points": points}))
            .send()
            .await
            .map_err(|e| self.store_err(e))?;
        // The server applies the batch transactionally; a non-2xx means
        // nothing persisted, so no client-side rollback is needed.
        self.expect_ok(response).await.map(|_| ())
    }

    async fn search(
        &self,
        collection: &str,
        query_vector: &[f32],
        k: usize,
    ) -> Result<VdbSearchResults> {
        let safe = self.names.safe(collection);
        let response = self
            .http
            .post(format!("{}/points/search", self.collection_url(&safe)))
            .json(&serde_json::json!({"vector": query_vector, "limit": k}))
            .send()
            .await
            .map_err(|e| self.store_err(e))?;

        if response.status().as_u16() == 404 {
            return Ok(VdbSearchResults::empty());
        }
        let response = self.expect_ok(response).await?;
        let parsed: RemoteSearchResponse = response
            .json()
            .await
            .map_err(|e| self.store_err(format!("malformed search response: {e}")))?;

        let mut results = VdbSearchResults::empty();
        for hit in parsed.hits {
            results.ids[0].push(hit.id);
            results.distances[0].push(hit.distance);
            results.metadatas[0].push(hit.metadata);
            if let Some(docs) = results.documents.as_mut() {
                docs[0].push(hit.document.unwrap_or_default());
            }
        }
        Ok(results)
    }

    async fn delete_by_file_id(&self, collection: &str, file_id: &str) -> Result<()> {
        let safe = self.names.safe(collection);
        let response = self
            .http
            .post(format!("{}/points/delete", self.collection_url(&safe)))
            .json(&serde_json::json!({
                "filter": {"metadata.file_id": file_id}
            }))
            .send()
            .await
            .map_err(|e| self.store_err(e))?;
        if response.status().as_u16() == 404 {
            return Ok(());
        }
        self.expect_ok(response).await.map(|_| ())
    }

    async fn delete_collection(&self, collection: &str) -> Result<()> {
        let safe = self.names.safe(collection);
        let response = self
            .http
            .delete(self.collection_url(&safe))
            .send()
            .await
            .map_err(|e| self.store_err(e))?;
        self.names.forget(collection);
        if response.status().as_u16() == 404 {
            return Ok(());
        }
        self.expect_ok(response).await.map(|_| ())
    }
}
