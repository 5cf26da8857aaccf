//! The RAG engine seam.
//!
//! Exactly one engine owns a knowledge base's ingestion and retrieval.
//! External engines live in the plugin runtime and are reached through the
//! RPC connector; [`LocalRagEngine`] is the built-in fallback that chunks,
//! embeds, and searches through the vector-database layer directly.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use relaybot_llm::{EmbeddingRequester, ModelManager};
use relaybot_types::error::{RelayError, Result};
use relaybot_types::rag::RetrievalResultEntry;
use relaybot_vdb::VdbManager;

use crate::storage::ObjectStorage;

/// Context handed to an engine for one document ingestion.
#[derive(Debug, Clone)]
pub struct IngestContext {
    pub document_id: String,
    pub file_name: String,
    pub extension: String,
    /// Key of the blob in object storage.
    pub storage_path: String,
    pub kb_id: String,
    pub collection_id: String,
    /// From KB creation settings; `"fixed_size"` when unset.
    pub chunking_strategy: String,
    pub embedding_model_uuid: String,
}

/// Context handed to an engine for one retrieval.
#[derive(Debug, Clone)]
pub struct RetrieveContext {
    pub query: String,
    pub kb_id: String,
    pub collection_id: String,
    pub top_k: usize,
    pub retrieval_settings: serde_json::Value,
    pub creation_settings: serde_json::Value,
    pub embedding_model_uuid: String,
}

/// An engine owning a knowledge base's content.
#[async_trait]
pub trait RagEngine: Send + Sync {
    /// Advertised capabilities, e.g. `"doc_ingestion"`.
    fn capabilities(&self) -> Vec<String>;

    /// Notification that a KB bound to this engine was created.
    async fn on_kb_create(&self, kb_id: &str, creation_settings: &serde_json::Value) -> Result<()>;

    /// Ingest one document.
    async fn ingest(&self, context: IngestContext) -> Result<()>;

    /// Retrieve entries for a query.
    async fn retrieve(&self, context: RetrieveContext) -> Result<Vec<RetrievalResultEntry>>;

    /// Remove one document's content.
    async fn delete_document(&self, file_id: &str, kb_id: &str) -> Result<()>;

    /// Notification that a KB bound to this engine was deleted.
    async fn on_kb_delete(&self, kb_id: &str) -> Result<()>;
}

/// Fixed-size chunk length in characters for the local engine.
const CHUNK_SIZE: usize = 800;
/// Overlap between adjacent chunks.
const CHUNK_OVERLAP: usize = 100;

/// Built-in engine: fixed-size chunking, remote embedding, vector upsert.
///
/// Retrieval auto-configures against the default backend's capabilities
/// through the retrieval orchestrator.
pub struct LocalRagEngine {
    vdb: Arc<VdbManager>,
    models: Arc<ModelManager>,
    embedder: Arc<dyn EmbeddingRequester>,
    storage: Arc<dyn ObjectStorage>,
}

impl LocalRagEngine {
    pub fn new(
        vdb: Arc<VdbManager>,
        models: Arc<ModelManager>,
        embedder: Arc<dyn EmbeddingRequester>,
        storage: Arc<dyn ObjectStorage>,
    ) -> Self {
        Self {
            vdb,
            models,
            embedder,
            storage,
        }
    }

    fn chunk(text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        if chars.is_empty() {
            return Vec::new();
        }
        let step = CHUNK_SIZE.saturating_sub(CHUNK_OVERLAP).max(1);
        let mut chunks = Vec::new();
        let mut start = 0;
        while start < chars.len() {
            let end = (start + CHUNK_SIZE).min(chars.len());
            chunks.push(chars[start..end].iter().collect());
            if end == chars.len() {
                break;
            }
            start += step;
        }
        chunks
    }
}

#[async_trait]
impl RagEngine for LocalRagEngine {
    fn capabilities(&self) -> Vec<String> {
        vec!["doc_ingestion".into(), "retrieval".into()]
    }

    async fn on_kb_create(&self, kb_id: &str, _creation_settings: &serde_json::Value) -> Result<()> {
        debug!(kb_id, "local engine bound to knowledge base");
        Ok(())
    }

    async fn ingest(&self, context: IngestContext) -> Result<()> {
        let bytes = self.storage.load(&context.storage_path).await?;
        let text = String::from_utf8_lossy(&bytes).into_owned();
        let chunks = Self::chunk(&text);
        if chunks.is_empty() {
            return Ok(());
        }

        let model = self.models.get_embedding(&context.embedding_model_uuid)?;
        let vectors = self
            .embedder
            .embed(model, &chunks)
            .await
            .map_err(|e| RelayError::Embedding(e.to_string()))?;

        let ids: Vec<String> = (0..chunks.len())
            .map(|i| format!("{}_{}", context.document_id, i))
            .collect();
        let metadatas: Vec<serde_json::Map<String, serde_json::Value>> = (0..chunks.len())
            .map(|i| {
                let mut m = serde_json::Map::new();
                m.insert("file_id".into(), serde_json::json!(context.document_id));
                m.insert("file_name".into(), serde_json::json!(context.file_name));
                m.insert("chunk_index".into(), serde_json::json!(i));
                m
            })
            .collect();

        self.vdb
            .upsert(
                &context.collection_id,
                &ids,
                &vectors,
                &metadatas,
                Some(&chunks),
            )
            .await?;
        debug!(kb_id = %context.kb_id, chunks = chunks.len(), "ingested document");
        Ok(())
    }

    async fn retrieve(&self, context: RetrieveContext) -> Result<Vec<RetrievalResultEntry>> {
        let retriever = relaybot_retrieval::Retriever::auto_configure(
            Some(&self.vdb),
            context.collection_id.clone(),
            &context.embedding_model_uuid,
            self.models.clone(),
            self.embedder.clone(),
        )?;
        retriever.retrieve(&context.query, context.top_k).await
    }

    async fn delete_document(&self, file_id: &str, kb_id: &str) -> Result<()> {
        // collection_id == kb uuid for locally-owned KBs.
        self.vdb.delete_by_file_id(kb_id, file_id).await
    }

    async fn on_kb_delete(&self, kb_id: &str) -> Result<()> {
        self.vdb.delete_collection(kb_id).await
    }
}
