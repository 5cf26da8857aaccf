//! The retrieval orchestrator.
//!
//! Fans a query out across all configured providers in parallel, fuses
//! the ranked lists with Reciprocal Rank Fusion, and delegates the final
//! cut to the reranker.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{info, warn};

use relaybot_llm::{EmbeddingRequester, ModelManager};
use relaybot_types::error::Result;
use relaybot_types::rag::RetrievalResultEntry;
use relaybot_vdb::{Capability, VdbManager, VectorDatabase as _};

use crate::providers::{
    FullTextSearchProvider, HybridSearchProvider, ProviderSpec, RetrievalProvider,
    VectorSearchProvider,
};
use crate::rerank::{Reranker, SimpleReranker};

/// RRF constant; scores are `Σ 1 / (K_RRF + rank + 1)` with 0-indexed ranks.
const K_RRF: f32 = 60.0;

/// Cap on the oversampled candidate count handed to each provider.
const MAX_CANDIDATES: usize = 30;

/// Multi-provider retrieval orchestrator for one knowledge base.
pub struct Retriever {
    kb_id: String,
    providers: Vec<Box<dyn RetrievalProvider>>,
    reranker: Box<dyn Reranker>,
}

impl Retriever {
    /// Build from an explicit providers list.
    pub fn from_specs(
        specs: &[ProviderSpec],
        vdb_manager: &VdbManager,
        kb_id: impl Into<String>,
        embedding_model_uuid: &str,
        models: Arc<ModelManager>,
        embedder: Arc<dyn EmbeddingRequester>,
    ) -> Result<Self> {
        let kb_id = kb_id.into();
        let mut providers: Vec<Box<dyn RetrievalProvider>> = Vec::new();
        for spec in specs {
            info!(kb_id = %kb_id, provider = %spec.provider_type, "configured retrieval provider");
            match spec.provider_type.as_str() {
                "vector" | "vector_search" => providers.push(Box::new(VectorSearchProvider::new(
                    vdb_manager,
                    &spec.vdb,
                    kb_id.clone(),
                    embedding_model_uuid,
                    models.clone(),
                    embedder.clone(),
                )?)),
                "fulltext" | "fulltext_search" => providers.push(Box::new(
                    FullTextSearchProvider::new(vdb_manager, &spec.vdb, kb_id.clone())?,
                )),
                "hybrid" | "hybrid_search" => providers.push(Box::new(HybridSearchProvider::new(
                    vdb_manager,
                    &spec.vdb,
                    kb_id.clone(),
                    embedding_model_uuid,
                    models.clone(),
                    embedder.clone(),
                )?)),
                other => warn!(provider = %other, "skipping unknown retrieval provider type"),
            }
        }
        Ok(Self {
            kb_id,
            providers,
            reranker: Box::new(SimpleReranker),
        })
    }

    /// Auto-configure from the default backend's capabilities: `hybrid`
    /// when advertised, else `vector`. A missing VDB manager yields a
    /// retriever with zero providers that returns empty results.
    pub fn auto_configure(
        vdb_manager: Option<&VdbManager>,
        kb_id: impl Into<String>,
        embedding_model_uuid: &str,
        models: Arc<ModelManager>,
        embedder: Arc<dyn EmbeddingRequester>,
    ) -> Result<Self> {
        let kb_id = kb_id.into();
        let Some(manager) = vdb_manager else {
            warn!(kb_id = %kb_id, "vector database manager not initialized; retrieval disabled");
            return Ok(Self {
                kb_id,
                providers: Vec::new(),
                reranker: Box::new(SimpleReranker),
            });
        };

        let prefers_hybrid = manager
            .default_db()
            .map(|db| db.get_capabilities().contains(&Capability::Hybrid))
            .unwrap_or(false);
        let spec = ProviderSpec {
            provider_type: if prefers_hybrid { "hybrid" } else { "vector" }.into(),
            vdb: "default".into(),
        };
        info!(kb_id = %kb_id, provider = %spec.provider_type, "auto-configured retrieval provider");
        Self::from_specs(
            &[spec],
            manager,
            kb_id,
            embedding_model_uuid,
            models,
            embedder,
        )
    }

    /// Test/bench seam: supply providers and reranker directly.
    pub fn with_providers(
        kb_id: impl Into<String>,
        providers: Vec<Box<dyn RetrievalProvider>>,
        reranker: Box<dyn Reranker>,
    ) -> Self {
        Self {
            kb_id: kb_id.into(),
            providers,
            reranker,
        }
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    /// Retrieve the fused, reranked top-k entries for `query`.
    pub async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<RetrievalResultEntry>> {
        if self.providers.is_empty() {
            warn!(kb_id = %self.kb_id, "no retrieval providers configured");
            return Ok(Vec::new());
        }

        // Oversample so fusion has room to work.
        let candidate_k = (top_k * 2).min(MAX_CANDIDATES);

        let tasks = self
            .providers
            .iter()
            .map(|p| p.retrieve(query, candidate_k));
        let per_provider = join_all(tasks).await;

        let mut fused_scores: HashMap<String, f32> = HashMap::new();
        let mut entries_by_id: HashMap<String, RetrievalResultEntry> = HashMap::new();
        for (provider, result) in self.providers.iter().zip(per_provider) {
            let ranked = match result {
                Ok(ranked) => ranked,
                Err(e) => {
                    warn!(kb_id = %self.kb_id, provider = provider.provider_type(), error = %e,
                          "retrieval provider failed; continuing with remaining providers");
                    continue;
                }
            };
            for (rank, entry) in ranked.into_iter().enumerate() {
                *fused_scores.entry(entry.id.clone()).or_default() +=
                    1.0 / (K_RRF + rank as f32 + 1.0);
                entries_by_id.entry(entry.id.clone()).or_insert(entry);
            }
        }

        let mut merged: Vec<RetrievalResultEntry> = entries_by_id
            .into_values()
            .map(|mut entry| {
                let score = fused_scores.get(&entry.id).copied().unwrap_or(0.0);
                entry
                    .metadata
                    .insert("rrf_score".into(), serde_json::json!(score));
                entry
            })
            .collect();
        merged.sort_by(|a, b| {
            let sa = fused_scores.get(&a.id).copied().unwrap_or(0.0);
            let sb = fused_scores.get(&b.id).copied().unwrap_or(0.0);
            sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
        });

        self.reranker.rerank(query, merged, top_k).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FixedProvider(Vec<&'static str>);

    #[async_trait]
    impl RetrievalProvider for FixedProvider {
        fn provider_type(&self) -> &'static str {
            "fixed"
        }

        async fn retrieve(
            &self,
            _query: &str,
            top_k: usize,
        ) -> Result<Vec<RetrievalResultEntry>> {
            Ok(self
                .0
                .iter()
                .take(top_k)
                .map(|id| RetrievalResultEntry::from_text(*id, format!("text {id}"), 0.0))
                .collect())
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl RetrievalProvider for FailingProvider {
        fn provider_type(&self) -> &'static str {
            "failing"
        }

        async fn retrieve(
            &self,
            _query: &str,
            _top_k: usize,
        ) -> Result<Vec<RetrievalResultEntry>> {
            Err(relaybot_types::RelayError::VectorStore {
                provider: "failing".into(),
                message: "down".into(),
            })
        }
    }

    fn retriever(providers: Vec<Box<dyn RetrievalProvider>>) -> Retriever {
        Retriever::with_providers("kb-test", providers, Box::new(SimpleReranker))
    }

    #[tokio::test]
    async fn zero_providers_returns_empty() {
        let r = retriever(vec![]);
        assert!(r.retrieve("anything", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rrf_fusion_fixed_scenario() {
        // Provider A: [X, Y, Z]; provider B: [Y, Z, W].
        // Y: 1/62 + 1/61, Z: 1/63 + 1/62, X: 1/61, W: 1/63.
        let r = retriever(vec![
            Box::new(FixedProvider(vec!["X", "Y", "Z"])),
            Box::new(FixedProvider(vec!["Y", "Z", "W"])),
        ]);
        let out = r.retrieve("q", 3).await.unwrap();
        let ids: Vec<&str> = out.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["Y", "Z", "X"]);
    }

    #[tokio::test]
    async fn rrf_invariants_hold() {
        let r = retriever(vec![
            Box::new(FixedProvider(vec!["a", "b", "c", "d"])),
            Box::new(FixedProvider(vec!["c", "a", "e"])),
        ]);
        let out = r.retrieve("q", 3).await.unwrap();
        assert!(out.len() <= 3);

        // Distinct ids.
        let mut ids: Vec<&str> = out.iter().map(|e| e.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), out.len());

        // Monotonically non-increasing RRF scores.
        let scores: Vec<f64> = out
            .iter()
            .map(|e| e.metadata["rrf_score"].as_f64().unwrap())
            .collect();
        assert!(scores.windows(2).all(|w| w[0] >= w[1]));
    }

    #[tokio::test]
    async fn failing_provider_does_not_abort_fusion() {
        let r = retriever(vec![
            Box::new(FailingProvider),
            Box::new(FixedProvider(vec!["a", "b"])),
        ]);
        let out = r.retrieve("q", 2).await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].id, "a");
    }

    #[tokio::test]
    async fn first_provider_payload_wins_for_shared_ids() {
        struct Tagged(&'static str);

        #[async_trait]
        impl RetrievalProvider for Tagged {
            fn provider_type(&self) -> &'static str {
                "tagged"
            }
            async fn retrieve(
                &self,
                _query: &str,
                _top_k: usize,
            ) -> Result<Vec<RetrievalResultEntry>> {
                Ok(vec![RetrievalResultEntry::from_text(
                    "same",
                    self.0.to_string(),
                    0.0,
                )])
            }
        }

        let r = retriever(vec![Box::new(Tagged("first")), Box::new(Tagged("second"))]);
        let out = r.retrieve("q", 1).await.unwrap();
        assert_eq!(out[0].text(), "first");
    }

    #[tokio::test]
    async fn auto_configure_without_manager_disables_retrieval() {
        let models = Arc::new(ModelManager::default());
        struct NoEmbed;
        #[async_trait]
        impl EmbeddingRequester for NoEmbed {
            async fn embed(
                &self,
                _m: &relaybot_types::provider::EmbeddingModel,
                _t: &[String],
            ) -> std::result::Result<Vec<Vec<f32>>, relaybot_types::error::RequesterError>
            {
                unreachable!("never called")
            }
        }
        let r =
            Retriever::auto_configure(None, "kb", "e1", models, Arc::new(NoEmbed)).unwrap();
        assert_eq!(r.provider_count(), 0);
        assert!(r.retrieve("q", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn auto_configure_prefers_hybrid_capability() {
        let manager = VdbManager::in_memory();
        let models = Arc::new(ModelManager::default());
        struct NoEmbed;
        #[async_trait]
        impl EmbeddingRequester for NoEmbed {
            async fn embed(
                &self,
                _m: &relaybot_types::provider::EmbeddingModel,
                _t: &[String],
            ) -> std::result::Result<Vec<Vec<f32>>, relaybot_types::error::RequesterError>
            {
                Ok(vec![vec![0.0]])
            }
        }
        let r = Retriever::auto_configure(Some(&manager), "kb", "e1", models, Arc::new(NoEmbed))
            .unwrap();
        // The memory backend advertises hybrid, so exactly one provider exists.
        assert_eq!(r.provider_count(), 1);
    }
}
