//! The [`VectorDatabase`] contract.

use std::collections::HashSet;

use async_trait::async_trait;

use relaybot_types::error::{RelayError, Result};

/// A search mode a backend may support. `Vector` is always present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Vector,
    Fulltext,
    Hybrid,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vector => "vector",
            Self::Fulltext => "fulltext",
            Self::Hybrid => "hybrid",
        }
    }
}

/// Search results in batch-of-one shape: outer vec has one entry per query
/// (always exactly one here), inner vecs are ranked hits.
#[derive(Debug, Clone, Default)]
pub struct VdbSearchResults {
    pub ids: Vec<Vec<String>>,
    pub distances: Vec<Vec<f32>>,
    pub metadatas: Vec<Vec<serde_json::Map<String, serde_json::Value>>>,
    pub documents: Option<Vec<Vec<String>>>,
}

impl VdbSearchResults {
    /// An empty batch-of-one result.
    pub fn empty() -> Self {
        Self {
            ids: vec![vec![]],
            distances: vec![vec![]],
            metadatas: vec![vec![]],
            documents: Some(vec![vec![]]),
        }
    }

    /// Number of hits in the first (only) batch.
    pub fn len(&self) -> usize {
        self.ids.first().map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Uniform async contract over a vector store backend.
///
/// Collection names may be UUID-shaped; backends whose storage disallows
/// characters like hyphens must map names internally and keep the mapping,
/// so callers remain UUID-agnostic.
#[async_trait]
pub trait VectorDatabase: Send + Sync {
    /// Backend type name, e.g. `"memory"`, `"remote"`.
    fn name(&self) -> &str;

    /// Capabilities this backend supports. `vector` is always included.
    fn get_capabilities(&self) -> HashSet<Capability>;

    /// Idempotently ensure a collection exists.
    async fn get_or_create_collection(&self, collection: &str) -> Result<()>;

    /// Add rows to a collection.
    ///
    /// Preconditions: all vectors share the collection dimension;
    /// `ids`, `vectors`, and `metadatas` have equal lengths; metadata keys
    /// contain no NUL or control characters other than `\t\n\r`; the
    /// `text` key is reserved for `documents` and rejected in metadata.
    /// On a mid-batch failure, rows inserted by the same call are rolled
    /// back.
    async fn add_embeddings(
        &self,
        collection: &str,
        ids: &[String],
        vectors: &[Vec<f32>],
        metadatas: &[serde_json::Map<String, serde_json::Value>],
        documents: Option<&[String]>,
    ) -> Result<()>;

    /// Nearest-neighbour search. Empty results if the collection is absent.
    async fn search(
        &self,
        collection: &str,
        query_vector: &[f32],
        k: usize,
    ) -> Result<VdbSearchResults>;

    /// Keyword search. Backends without the `fulltext` capability reject.
    async fn search_fulltext(
        &self,
        collection: &str,
        query: &str,
        k: usize,
    ) -> Result<VdbSearchResults> {
        let _ = (collection, query, k);
        Err(RelayError::VectorStore {
            provider: self.name().to_string(),
            message: "full-text search is not supported by this backend".into(),
        })
    }

    /// Combined search with backend-native fusion. Backends without the
    /// `hybrid` capability reject.
    async fn search_hybrid(
        &self,
        collection: &str,
        query_vector: &[f32],
        query: &str,
        k: usize,
    ) -> Result<VdbSearchResults> {
        let _ = (collection, query_vector, query, k);
        Err(RelayError::VectorStore {
            provider: self.name().to_string(),
            message: "hybrid search is not supported by this backend".into(),
        })
    }

    /// Delete rows whose `metadata.file_id` matches.
    async fn delete_by_file_id(&self, collection: &str, file_id: &str) -> Result<()>;

    /// Drop a collection entirely.
    async fn delete_collection(&self, collection: &str) -> Result<()>;
}

/// Validate the shared `add_embeddings` preconditions.
///
/// Backends call this before touching storage so error behavior is uniform.
pub fn validate_batch(
    backend: &str,
    ids: &[String],
    vectors: &[Vec<f32>],
    metadatas: &[serde_json::Map<String, serde_json::Value>],
    expected_dimension: Option<usize>,
) -> Result<()> {
    let err = |message: String| RelayError::VectorStore {
        provider: backend.to_string(),
        message,
    };

    if ids.len() != vectors.len() || ids.len() != metadatas.len() {
        return Err(err(format!(
            "length mismatch: {} ids, {} vectors, {} metadatas",
            ids.len(),
            vectors.len(),
            metadatas.len()
        )));
    }

    if let Some(first) = vectors.first() {
        let dim = expected_dimension.unwrap_or(first.len());
        if let Some(bad) = vectors.iter().find(|v| v.len() != dim) {
            return Err(err(format!(
                "vector dimension {} does not match collection dimension {dim}",
                bad.len()
            )));
        }
    }

    for metadata in metadatas {
        for key in metadata.keys() {
            if key == "text" {
                return Err(err(
                    "metadata key 'text' is reserved; pass document text via documents".into(),
                ));
            }
            if key
                .chars()
                .any(|c| c == '\0' || (c.is_control() && !matches!(c, '\t' | '\n' | '\r')))
            {
                return Err(err(format!("metadata key {key:?} contains control characters")));
            }
        }
    }

    Ok(())
}
