//! Retrieval result types shared by the vector, retrieval, and RAG crates.

use serde::{Deserialize, Serialize};

use crate::provider::ContentElement;

/// One retrieved chunk.
///
/// `distance` is backend-defined (smaller = closer for distance metrics);
/// rank fusion records its score under `metadata["rrf_score"]`, and a
/// reranker may overwrite `distance` with a relevance score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResultEntry {
    pub id: String,
    pub content: Vec<ContentElement>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub distance: f32,
}

impl RetrievalResultEntry {
    pub fn from_text(id: impl Into<String>, text: impl Into<String>, distance: f32) -> Self {
        Self {
            id: id.into(),
            content: vec![ContentElement::from_text(text)],
            metadata: serde_json::Map::new(),
            distance,
        }
    }

    /// Concatenated text content.
    pub fn text(&self) -> String {
        self.content.iter().map(ContentElement::text).collect()
    }
}
