//! Model registry.
//!
//! Materialized config snapshots of every configured chat and embedding
//! model, keyed by uuid. Loaded once at startup; pipeline configs refer to
//! models by uuid only.

use std::collections::HashMap;

use relaybot_types::error::{RelayError, Result};
use relaybot_types::provider::{EmbeddingModel, LlmModel};

/// Registry of configured models.
#[derive(Debug, Default)]
pub struct ModelManager {
    llm: HashMap<String, LlmModel>,
    embedding: HashMap<String, EmbeddingModel>,
}

impl ModelManager {
    pub fn new(llm_models: Vec<LlmModel>, embedding_models: Vec<EmbeddingModel>) -> Self {
        Self {
            llm: llm_models.into_iter().map(|m| (m.uuid.clone(), m)).collect(),
            embedding: embedding_models
                .into_iter()
                .map(|m| (m.uuid.clone(), m))
                .collect(),
        }
    }

    pub fn get_llm(&self, uuid: &str) -> Result<&LlmModel> {
        self.llm
            .get(uuid)
            .ok_or_else(|| RelayError::NotFound(format!("llm model {uuid}")))
    }

    pub fn get_embedding(&self, uuid: &str) -> Result<&EmbeddingModel> {
        self.embedding
            .get(uuid)
            .ok_or_else(|| RelayError::NotFound(format!("embedding model {uuid}")))
    }

    pub fn llm_models(&self) -> impl Iterator<Item = &LlmModel> {
        self.llm.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_uuid() {
        let mgr = ModelManager::new(
            vec![LlmModel {
                uuid: "m1".into(),
                name: "test".into(),
                abilities: vec!["vision".into()],
                api_base: "http://localhost".into(),
                api_key: String::new(),
            }],
            vec![],
        );
        assert_eq!(mgr.get_llm("m1").unwrap().name, "test");
        assert!(matches!(
            mgr.get_llm("missing"),
            Err(RelayError::NotFound(_))
        ));
        assert!(matches!(
            mgr.get_embedding("none"),
            Err(RelayError::NotFound(_))
        ));
    }
}
