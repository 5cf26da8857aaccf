//! Shared component graph handed to pipeline stages.

use std::sync::Arc;

use relaybot_llm::{EmbeddingRequester, ModelManager, Requester};
use relaybot_plugin::PluginConnector;
use relaybot_rag::KnowledgeBaseManager;

use crate::query::QueryPool;
use crate::session::SessionManager;

/// Everything a stage may need, wired once at startup.
pub struct CoreContext {
    pub sessions: Arc<SessionManager>,
    pub models: Arc<ModelManager>,
    pub requester: Arc<dyn Requester>,
    pub embedder: Option<Arc<dyn EmbeddingRequester>>,
    /// Absent when the plugin runtime is disabled.
    pub plugin: Option<Arc<PluginConnector>>,
    /// Absent when no knowledge bases are configured.
    pub kb: Option<Arc<KnowledgeBaseManager>>,
    pub pool: Arc<QueryPool>,
}

impl CoreContext {
    /// Minimal context for tests: no plugin runtime, no knowledge bases.
    pub fn minimal(requester: Arc<dyn Requester>, pool: Arc<QueryPool>) -> Self {
        Self {
            sessions: Arc::new(SessionManager::new()),
            models: Arc::new(ModelManager::default()),
            requester,
            embedder: None,
            plugin: None,
            kb: None,
            pool,
        }
    }
}
