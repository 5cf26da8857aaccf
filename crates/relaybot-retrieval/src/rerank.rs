//! Reranking seam.
//!
//! The retriever hands the RRF-ordered candidate list to a [`Reranker`].
//! [`SimpleReranker`] keeps the fused order and truncates; model-backed
//! rerankers overwrite `distance` with a relevance score before cutting.

use async_trait::async_trait;

use relaybot_types::error::Result;
use relaybot_types::rag::RetrievalResultEntry;

/// Consumes the fused candidate list, returns the final ordered top-k.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(
        &self,
        query: &str,
        entries: Vec<RetrievalResultEntry>,
        top_k: usize,
    ) -> Result<Vec<RetrievalResultEntry>>;
}

/// Order-preserving truncation.
#[derive(Debug, Default)]
pub struct SimpleReranker;

#[async_trait]
impl Reranker for SimpleReranker {
    async fn rerank(
        &self,
        _query: &str,
        mut entries: Vec<RetrievalResultEntry>,
        top_k: usize,
    ) -> Result<Vec<RetrievalResultEntry>> {
        entries.truncate(top_k);
        Ok(entries)
    }
}
