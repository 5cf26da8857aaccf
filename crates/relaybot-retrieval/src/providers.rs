//! Retrieval providers.
//!
//! Each provider is one retrieval strategy against one configured vector
//! database. Vector and hybrid providers embed the query through the
//! knowledge base's embedding model; full-text skips embedding entirely.
//! Capability checks happen at construction so a misconfigured provider
//! fails fast rather than at query time.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use relaybot_llm::{EmbeddingRequester, ModelManager};
use relaybot_types::error::{RelayError, Result};
use relaybot_types::rag::RetrievalResultEntry;
use relaybot_vdb::{Capability, VdbManager, VdbSearchResults, VectorDatabase};

/// One entry of an explicit providers list in retriever config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSpec {
    /// `"vector"`, `"fulltext"`, or `"hybrid"` (long forms with a
    /// `_search` suffix accepted).
    #[serde(rename = "type")]
    pub provider_type: String,
    /// Configured VDB name; `"default"` when absent.
    #[serde(default = "default_vdb_name")]
    pub vdb: String,
}

fn default_vdb_name() -> String {
    "default".into()
}

/// A single retrieval strategy.
#[async_trait]
pub trait RetrievalProvider: Send + Sync {
    /// Strategy name, used in error kinds and logs.
    fn provider_type(&self) -> &'static str;

    /// Retrieve up to `top_k` entries for `query`.
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<RetrievalResultEntry>>;
}

/// Resolve a VDB by name, falling back to the manager default.
fn resolve_vdb(manager: &VdbManager, name: &str) -> Result<Arc<dyn VectorDatabase>> {
    manager
        .get_db(name)
        .or_else(|| manager.default_db())
        .ok_or_else(|| RelayError::NotFound(format!("vector database {name:?}")))
}

/// Fail unless `db` advertises `capability`.
fn check_capability(db: &Arc<dyn VectorDatabase>, capability: Capability) -> Result<()> {
    if db.get_capabilities().contains(&capability) {
        Ok(())
    } else {
        Err(RelayError::VectorStore {
            provider: db.name().to_string(),
            message: format!(
                "backend does not support {:?} search",
                capability.as_str()
            ),
        })
    }
}

/// Flatten the batch-of-one VDB shape into entries.
///
/// Document text comes from `documents[i]` when present, otherwise from
/// the row's `metadata.text`.
pub(crate) fn convert_vdb_results(results: VdbSearchResults) -> Vec<RetrievalResultEntry> {
    let ids = results.ids.into_iter().next().unwrap_or_default();
    let distances = results.distances.into_iter().next().unwrap_or_default();
    let metadatas = results.metadatas.into_iter().next().unwrap_or_default();
    let documents = results
        .documents
        .and_then(|d| d.into_iter().next());

    ids.into_iter()
        .enumerate()
        .map(|(i, id)| {
            let metadata = metadatas.get(i).cloned().unwrap_or_default();
            let text = documents
                .as_ref()
                .and_then(|docs| docs.get(i))
                .filter(|t| !t.is_empty())
                .cloned()
                .or_else(|| {
                    metadata
                        .get("text")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                })
                .unwrap_or_default();
            let mut entry =
                RetrievalResultEntry::from_text(id, text, distances.get(i).copied().unwrap_or(0.0));
            entry.metadata = metadata;
            entry
        })
        .collect()
}

/// Shared state of the embedding-backed providers.
struct EmbeddingContext {
    kb_id: String,
    embedding_model_uuid: String,
    models: Arc<ModelManager>,
    embedder: Arc<dyn EmbeddingRequester>,
}

impl EmbeddingContext {
    /// Embed the query. The model is resolved at call time so a model
    /// swap does not require rebuilding providers.
    async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        let model = self.models.get_embedding(&self.embedding_model_uuid)?;
        let mut vectors = self
            .embedder
            .embed(model, &[query.to_string()])
            .await
            .map_err(|e| RelayError::Embedding(e.to_string()))?;
        vectors
            .pop()
            .ok_or_else(|| RelayError::Embedding("embedder returned no vectors".into()))
    }
}

/// Nearest-neighbour retrieval.
pub struct VectorSearchProvider {
    db: Arc<dyn VectorDatabase>,
    context: EmbeddingContext,
}

impl VectorSearchProvider {
    pub fn new(
        manager: &VdbManager,
        vdb_name: &str,
        kb_id: impl Into<String>,
        embedding_model_uuid: impl Into<String>,
        models: Arc<ModelManager>,
        embedder: Arc<dyn EmbeddingRequester>,
    ) -> Result<Self> {
        let db = resolve_vdb(manager, vdb_name)?;
        check_capability(&db, Capability::Vector)?;
        Ok(Self {
            db,
            context: EmbeddingContext {
                kb_id: kb_id.into(),
                embedding_model_uuid: embedding_model_uuid.into(),
                models,
                embedder,
            },
        })
    }
}

#[async_trait]
impl RetrievalProvider for VectorSearchProvider {
    fn provider_type(&self) -> &'static str {
        "vector"
    }

    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<RetrievalResultEntry>> {
        let vector = self.context.embed_query(query).await?;
        let results = self.db.search(&self.context.kb_id, &vector, top_k).await?;
        Ok(convert_vdb_results(results))
    }
}

/// Keyword retrieval; no embedding involved.
pub struct FullTextSearchProvider {
    db: Arc<dyn VectorDatabase>,
    kb_id: String,
}

impl std::fmt::Debug for FullTextSearchProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FullTextSearchProvider")
            .field("kb_id", &self.kb_id)
            .finish_non_exhaustive()
    }
}

impl FullTextSearchProvider {
    pub fn new(manager: &VdbManager, vdb_name: &str, kb_id: impl Into<String>) -> Result<Self> {
        let db = resolve_vdb(manager, vdb_name)?;
        check_capability(&db, Capability::Fulltext)?;
        Ok(Self {
            db,
            kb_id: kb_id.into(),
        })
    }
}

#[async_trait]
impl RetrievalProvider for FullTextSearchProvider {
    fn provider_type(&self) -> &'static str {
        "fulltext"
    }

    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<RetrievalResultEntry>> {
        let results = self.db.search_fulltext(&self.kb_id, query, top_k).await?;
        Ok(convert_vdb_results(results))
    }
}

/// Combined retrieval with backend-native fusion.
pub struct HybridSearchProvider {
    db: Arc<dyn VectorDatabase>,
    context: EmbeddingContext,
}

impl HybridSearchProvider {
    pub fn new(
        manager: &VdbManager,
        vdb_name: &str,
        kb_id: impl Into<String>,
        embedding_model_uuid: impl Into<String>,
        models: Arc<ModelManager>,
        embedder: Arc<dyn EmbeddingRequester>,
    ) -> Result<Self> {
        let db = resolve_vdb(manager, vdb_name)?;
        check_capability(&db, Capability::Hybrid)?;
        Ok(Self {
            db,
            context: EmbeddingContext {
                kb_id: kb_id.into(),
                embedding_model_uuid: embedding_model_uuid.into(),
                models,
                embedder,
            },
        })
    }
}

#[async_trait]
impl RetrievalProvider for HybridSearchProvider {
    fn provider_type(&self) -> &'static str {
        "hybrid"
    }

    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<RetrievalResultEntry>> {
        // The query embedding is a single vector by type; no batch-of-one
        // shape guessing happens here.
        let vector = self.context.embed_query(query).await?;
        let results = self
            .db
            .search_hybrid(&self.context.kb_id, &vector, query, top_k)
            .await?;
        Ok(convert_vdb_results(results))
    }
}
