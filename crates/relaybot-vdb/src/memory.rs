//! In-memory vector database.
//!
//! Brute-force cosine search over per-collection row vectors, with
//! token-overlap keyword scoring for full-text and a native weighted
//! fusion for hybrid. Advertises all three capabilities, which makes it
//! the backend of choice for tests and small deployments.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use relaybot_types::error::{RelayError, Result};

use crate::database::{validate_batch, Capability, VdbSearchResults, VectorDatabase};

#[derive(Debug, Clone)]
struct Row {
    id: String,
    vector: Vec<f32>,
    metadata: serde_json::Map<String, serde_json::Value>,
    document: String,
}

#[derive(Debug, Default)]
struct Collection {
    dimension: Option<usize>,
    rows: Vec<Row>,
}

/// Brute-force in-memory backend.
#[derive(Debug, Default)]
pub struct MemoryVectorDatabase {
    collections: Arc<RwLock<HashMap<String, Collection>>>,
}

impl MemoryVectorDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self, collection: &str) -> Option<Vec<Row>> {
        self.collections
            .read()
            .get(collection)
            .map(|c| c.rows.clone())
    }

    fn ranked_to_results(ranked: Vec<(Row, f32)>) -> VdbSearchResults {
        let mut results = VdbSearchResults::empty();
        for (row, distance) in ranked {
            results.ids[0].push(row.id);
            results.distances[0].push(distance);
            results.metadatas[0].push(row.metadata);
            if let Some(docs) = results.documents.as_mut() {
                docs[0].push(row.document);
            }
        }
        results
    }

    /// Keyword score in `[0, 1]`: fraction of query tokens present in the
    /// document.
    fn fulltext_score(document: &str, query_tokens: &HashSet<String>) -> f32 {
        if query_tokens.is_empty() {
            return 0.0;
        }
        let doc_tokens: HashSet<String> = tokenize(document);
        let hits = query_tokens.intersection(&doc_tokens).count();
        hits as f32 / query_tokens.len() as f32
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn top_k(mut scored: Vec<(Row, f32)>, k: usize) -> Vec<(Row, f32)> {
    // Ascending by distance.
    scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(k);
    scored
}

#[async_trait]
impl VectorDatabase for MemoryVectorDatabase {
    fn name(&self) -> &str {
        "memory"
    }

    fn get_capabilities(&self) -> HashSet<Capability> {
        [Capability::Vector, Capability::Fulltext, Capability::Hybrid]
            .into_iter()
            .collect()
    }

    async fn get_or_create_collection(&self, collection: &str) -> Result<()> {
        self.collections
            .write()
            .entry(collection.to_string())
            .or_default();
        Ok(())
    }

    async fn add_embeddings(
        &self,
        collection: &str,
        ids: &[String],
        vectors: &[Vec<f32>],
        metadatas: &[serde_json::Map<String, serde_json::Value>],
        documents: Option<&[String]>,
    ) -> Result<()> {
        let expected = self
            .collections
            .read()
            .get(collection)
            .and_then(|c| c.dimension);
        validate_batch(self.name(), ids, vectors, metadatas, expected)?;

        if let Some(docs) = documents {
            if docs.len() != ids.len() {
                return Err(RelayError::VectorStore {
                    provider: self.name().into(),
                    message: format!(
                        "length mismatch: {} ids, {} documents",
                        ids.len(),
                        docs.len()
                    ),
                });
            }
        }

        let mut collections = self.collections.write();
        let entry = collections.entry(collection.to_string()).or_default();
        if entry.dimension.is_none() {
            entry.dimension = vectors.first().map(Vec::len);
        }
        for (i, id) in ids.iter().enumerate() {
            entry.rows.push(Row {
                id: id.clone(),
                vector: vectors[i].clone(),
                metadata: metadatas[i].clone(),
                document: documents.map(|d| d[i].clone()).unwrap_or_default(),
            });
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        query_vector: &[f32],
        k: usize,
    ) -> Result<VdbSearchResults> {
        let Some(rows) = self.snapshot(collection) else {
            return Ok(VdbSearchResults::empty());
        };
        let query = query_vector.to_vec();
        // Brute-force scoring is CPU-bound; keep it off the event loop.
        let ranked = tokio::task::spawn_blocking(move || {
            let scored = rows
                .into_iter()
                .map(|row| {
                    let distance = 1.0 - cosine_similarity(&query, &row.vector);
                    (row, distance)
                })
                .collect();
            top_k(scored, k)
        })
        .await
        .map_err(|e| RelayError::VectorStore {
            provider: "memory".into(),
            message: format!("search task failed: {e}"),
        })?;
        Ok(Self::ranked_to_results(ranked))
    }

    async fn search_fulltext(
        &self,
        collection: &str,
        query: &str,
        k: usize,
    ) -> Result<VdbSearchResults> {
        let Some(rows) = self.snapshot(collection) else {
            return Ok(VdbSearchResults::empty());
        };
        let query_tokens = tokenize(query);
        let scored = rows
            .into_iter()
            .filter_map(|row| {
                let score = Self::fulltext_score(&row.document, &query_tokens);
                (score > 0.0).then(|| (row, 1.0 - score))
            })
            .collect();
        Ok(Self::ranked_to_results(top_k(scored, k)))
    }

    async fn search_hybrid(
        &self,
        collection: &str,
        query_vector: &[f32],
        query: &str,
        k: usize,
    ) -> Result<VdbSearchResults> {
        let Some(rows) = self.snapshot(collection) else {
            return Ok(VdbSearchResults::empty());
        };
        let query_tokens = tokenize(query);
        let scored = rows
            .into_iter()
            .map(|row| {
                let vector_score = cosine_similarity(query_vector, &row.vector).max(0.0);
                let keyword_score = Self::fulltext_score(&row.document, &query_tokens);
                let fused = 0.5 * vector_score + 0.5 * keyword_score;
                (row, 1.0 - fused)
            })
            .collect();
        Ok(Self::ranked_to_results(top_k(scored, k)))
    }

    async fn delete_by_file_id(&self, collection: &str, file_id: &str) -> Result<()> {
        let mut collections = self.collections.write();
        if let Some(entry) = collections.get_mut(collection) {
            entry.rows.retain(|row| {
                row.metadata
                    .get("file_id")
                    .and_then(|v| v.as_str())
                    .map_or(true, |v| v != file_id)
            });
        }
        Ok(())
    }

    async fn delete_collection(&self, collection: &str) -> Result<()> {
        self.collections.write().remove(collection);
        Ok(())
    }
}
