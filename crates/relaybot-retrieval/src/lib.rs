//! Retrieval orchestration.
//!
//! A [`Retriever`](retriever::Retriever) fans a query out across one or
//! more [`RetrievalProvider`](providers::RetrievalProvider)s (vector,
//! full-text, hybrid), fuses the ranked lists with Reciprocal Rank Fusion,
//! and hands the merged list to a [`Reranker`](rerank::Reranker).

pub mod providers;
pub mod rerank;
pub mod retriever;

pub use providers::{ProviderSpec, RetrievalProvider};
pub use rerank::{Reranker, SimpleReranker};
pub use retriever::Retriever;
