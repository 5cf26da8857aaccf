//! The knowledge-base manager.
//!
//! Owns the `uuid -> RuntimeKnowledgeBase` map and the engine registry.
//! Creation rolls back both the runtime entry and the metadata row when
//! the engine rejects the KB; deletion removes the row before notifying
//! the engine so the user-facing listing is always consistent.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};
use uuid::Uuid;

use relaybot_types::error::{RelayError, Result};
use relaybot_types::rag::RetrievalResultEntry;

use crate::engine::RagEngine;
use crate::kb::RuntimeKnowledgeBase;
use crate::storage::ObjectStorage;
use crate::store::{FileRecord, FileStatus, KnowledgeBaseRecord, MetadataStore};

/// Parameters for [`KnowledgeBaseManager::create_kb`].
#[derive(Debug, Clone)]
pub struct CreateKbParams {
    pub name: String,
    pub description: String,
    pub embedding_model_uuid: String,
    pub top_k: Option<usize>,
    pub rag_engine_plugin_id: String,
    pub creation_settings: serde_json::Value,
}

/// Registry and lifecycle owner for knowledge bases.
pub struct KnowledgeBaseManager {
    store: Arc<dyn MetadataStore>,
    storage: Arc<dyn ObjectStorage>,
    engines: HashMap<String, Arc<dyn RagEngine>>,
    kbs: DashMap<String, Arc<RuntimeKnowledgeBase>>,
}

impl KnowledgeBaseManager {
    pub fn new(store: Arc<dyn MetadataStore>, storage: Arc<dyn ObjectStorage>) -> Self {
        Self {
            store,
            storage,
            engines: HashMap::new(),
            kbs: DashMap::new(),
        }
    }

    /// Register an engine under its plugin id.
    pub fn register_engine(&mut self, plugin_id: impl Into<String>, engine: Arc<dyn RagEngine>) {
        self.engines.insert(plugin_id.into(), engine);
    }

    fn engine_for(&self, plugin_id: &str) -> Result<Arc<dyn RagEngine>> {
        self.engines
            .get(plugin_id)
            .cloned()
            .ok_or_else(|| RelayError::NotFound(format!("rag engine plugin {plugin_id:?}")))
    }

    /// Load persisted KBs into the runtime map and reap orphaned files.
    ///
    /// Files still `pending` or `processing` at startup belong to ingest
    /// tasks that died with the previous process; they are marked failed.
    pub async fn load_from_store(&self) -> Result<()> {
        for record in self.store.list_kbs().await? {
            let engine = match self.engine_for(&record.rag_engine_plugin_id) {
                Ok(engine) => engine,
                Err(e) => {
                    warn!(kb = %record.uuid, error = %e, "skipping KB with missing engine");
                    continue;
                }
            };
            for file in self.store.list_files(&record.uuid).await? {
                if matches!(file.status, FileStatus::Pending | FileStatus::Processing) {
                    warn!(file = %file.uuid, kb = %record.uuid, "reaping orphaned ingest");
                    self.store
                        .update_file_status(&file.uuid, FileStatus::Failed)
                        .await?;
                }
            }
            let uuid = record.uuid.clone();
            self.kbs.insert(
                uuid,
                Arc::new(RuntimeKnowledgeBase::new(
                    record,
                    engine,
                    self.store.clone(),
                    self.storage.clone(),
                )),
            );
        }
        info!(count = self.kbs.len(), "knowledge bases loaded");
        Ok(())
    }

    /// Create a knowledge base and bind it to its engine.
    pub async fn create_kb(&self, params: CreateKbParams) -> Result<String> {
        let engine = self.engine_for(&params.rag_engine_plugin_id)?;

        let uuid = Uuid::new_v4().to_string();
        let record = KnowledgeBaseRecord {
            uuid: uuid.clone(),
            name: params.name,
            description: params.description,
            embedding_model_uuid: params.embedding_model_uuid,
            top_k: params.top_k,
            rag_engine_plugin_id: params.rag_engine_plugin_id,
            // The KB uuid doubles as the vector-store namespace.
            collection_id: uuid.clone(),
            creation_settings: params.creation_settings.clone(),
        };

        self.store.insert_kb(record.clone()).await?;
        self.kbs.insert(
            uuid.clone(),
            Arc::new(RuntimeKnowledgeBase::new(
                record,
                engine.clone(),
                self.store.clone(),
                self.storage.clone(),
            )),
        );

        if let Err(e) = engine.on_kb_create(&uuid, &params.creation_settings).await {
            // Roll back both the runtime entry and the row.
            self.kbs.remove(&uuid);
            if let Err(rollback) = self.store.delete_kb(&uuid).await {
                warn!(kb = %uuid, error = %rollback, "rollback of KB row failed");
            }
            return Err(e);
        }

        info!(kb = %uuid, "knowledge base created");
        Ok(uuid)
    }

    pub fn get_kb(&self, uuid: &str) -> Result<Arc<RuntimeKnowledgeBase>> {
        self.kbs
            .get(uuid)
            .map(|kb| kb.clone())
            .ok_or_else(|| RelayError::NotFound(format!("knowledge base {uuid}")))
    }

    pub fn list_kbs(&self) -> Vec<KnowledgeBaseRecord> {
        self.kbs.iter().map(|kb| kb.record.clone()).collect()
    }

    pub async fn list_files(&self, kb_uuid: &str) -> Result<Vec<FileRecord>> {
        self.get_kb(kb_uuid)?;
        self.store.list_files(kb_uuid).await
    }

    /// File upload and deletion require the engine's `doc_ingestion`
    /// capability; its absence is a user-visible error.
    fn check_doc_ingestion(&self, kb: &RuntimeKnowledgeBase) -> Result<()> {
        if kb
            .engine()
            .capabilities()
            .iter()
            .any(|c| c == "doc_ingestion")
        {
            Ok(())
        } else {
            Err(RelayError::Plugin(format!(
                "engine {:?} does not support document ingestion",
                kb.record.rag_engine_plugin_id
            )))
        }
    }

    pub async fn store_file(&self, kb_uuid: &str, file_id: &str) -> Result<String> {
        let kb = self.get_kb(kb_uuid)?;
        self.check_doc_ingestion(&kb)?;
        kb.store_file(file_id).await
    }

    pub async fn delete_file(&self, kb_uuid: &str, file_id: &str) -> Result<()> {
        let kb = self.get_kb(kb_uuid)?;
        self.check_doc_ingestion(&kb)?;
        kb.delete_file(file_id).await
    }

    pub async fn retrieve(
        &self,
        kb_uuid: &str,
        query: &str,
        top_k_override: Option<usize>,
        retrieval_settings: serde_json::Value,
    ) -> Result<Vec<RetrievalResultEntry>> {
        self.get_kb(kb_uuid)?
            .retrieve(query, top_k_override, retrieval_settings)
            .await
    }

    /// Delete a KB. The row goes first so listings stay consistent; an
    /// engine failure afterwards is logged, not restored.
    pub async fn delete_kb(&self, uuid: &str) -> Result<()> {
        let kb = self.get_kb(uuid)?;
        self.store.delete_kb(uuid).await?;
        self.kbs.remove(uuid);
        if let Err(e) = kb.engine().on_kb_delete(uuid).await {
            warn!(kb = %uuid, error = %e, "engine cleanup failed after KB deletion");
        }
        info!(kb = %uuid, "knowledge base deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{IngestContext, RetrieveContext};
    use crate::store::MemoryMetadataStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StubStorage;

    #[async_trait]
    impl ObjectStorage for StubStorage {
        async fn save(&self, _key: &str, _data: &[u8]) -> Result<()> {
            Ok(())
        }
        async fn load(&self, _key: &str) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
        async fn exists(&self, _key: &str) -> Result<bool> {
            Ok(true)
        }
        async fn delete(&self, _key: &str) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct StubEngine {
        fail_create: AtomicBool,
        no_ingestion: AtomicBool,
    }

    #[async_trait]
    impl RagEngine for StubEngine {
        fn capabilities(&self) -> Vec<String> {
            if self.no_ingestion.load(Ordering::SeqCst) {
                vec!["retrieval".into()]
            } else {
                vec!["doc_ingestion".into(), "retrieval".into()]
            }
        }
        async fn on_kb_create(
            &self,
            _kb_id: &str,
            _settings: &serde_json::Value,
        ) -> Result<()> {
            if self.fail_create.load(Ordering::SeqCst) {
                Err(RelayError::Plugin("engine rejected kb".into()))
            } else {
                Ok(())
            }
        }
        async fn ingest(&self, _context: IngestContext) -> Result<()> {
            Ok(())
        }
        async fn retrieve(
            &self,
            context: RetrieveContext,
        ) -> Result<Vec<RetrievalResultEntry>> {
            Ok(vec![RetrievalResultEntry::from_text(
                "r1",
                format!("top_k={}", context.top_k),
                0.1,
            )])
        }
        async fn delete_document(&self, _file_id: &str, _kb_id: &str) -> Result<()> {
            Ok(())
        }
        async fn on_kb_delete(&self, _kb_id: &str) -> Result<()> {
            Ok(())
        }
    }

    fn manager_with(engine: Arc<StubEngine>) -> (KnowledgeBaseManager, Arc<MemoryMetadataStore>) {
        let store = Arc::new(MemoryMetadataStore::new());
        let mut mgr = KnowledgeBaseManager::new(store.clone(), Arc::new(StubStorage));
        mgr.register_engine("stub", engine);
        (mgr, store)
    }

    fn params() -> CreateKbParams {
        CreateKbParams {
            name: "docs".into(),
            description: String::new(),
            embedding_model_uuid: "e1".into(),
            top_k: Some(3),
            rag_engine_plugin_id: "stub".into(),
            creation_settings: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn create_kb_sets_collection_to_uuid() {
        let (mgr, store) = manager_with(Arc::new(StubEngine::default()));
        let uuid = mgr.create_kb(params()).await.unwrap();
        let record = store.get_kb(&uuid).await.unwrap().unwrap();
        assert_eq!(record.collection_id, uuid);
        assert!(mgr.get_kb(&uuid).is_ok());
    }

    #[tokio::test]
    async fn create_kb_unknown_engine_fails() {
        let (mgr, _) = manager_with(Arc::new(StubEngine::default()));
        let mut p = params();
        p.rag_engine_plugin_id = "missing".into();
        assert!(matches!(
            mgr.create_kb(p).await,
            Err(RelayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn create_kb_rolls_back_on_engine_failure() {
        let engine = Arc::new(StubEngine::default());
        engine.fail_create.store(true, Ordering::SeqCst);
        let (mgr, store) = manager_with(engine);

        let err = mgr.create_kb(params()).await.unwrap_err();
        assert!(matches!(err, RelayError::Plugin(_)));
        assert!(mgr.list_kbs().is_empty());
        assert!(store.list_kbs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_kb_clears_row_and_runtime() {
        let (mgr, store) = manager_with(Arc::new(StubEngine::default()));
        let uuid = mgr.create_kb(params()).await.unwrap();
        mgr.delete_kb(&uuid).await.unwrap();
        assert!(mgr.get_kb(&uuid).is_err());
        assert!(store.get_kb(&uuid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retrieve_uses_override_then_kb_default() {
        let (mgr, _) = manager_with(Arc::new(StubEngine::default()));
        let uuid = mgr.create_kb(params()).await.unwrap();

        let out = mgr
            .retrieve(&uuid, "q", Some(7), serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(out[0].text(), "top_k=7");

        let out = mgr
            .retrieve(&uuid, "q", None, serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(out[0].text(), "top_k=3");
    }

    #[tokio::test]
    async fn file_ops_require_doc_ingestion_capability() {
        let engine = Arc::new(StubEngine::default());
        engine.no_ingestion.store(true, Ordering::SeqCst);
        let (mgr, _) = manager_with(engine);
        let uuid = mgr.create_kb(params()).await.unwrap();

        let err = mgr.store_file(&uuid, "doc.txt").await.unwrap_err();
        assert!(err.to_string().contains("document ingestion"));
        let err = mgr.delete_file(&uuid, "f1").await.unwrap_err();
        assert!(err.to_string().contains("document ingestion"));
    }

    #[tokio::test]
    async fn load_from_store_reaps_orphans() {
        let (mgr, store) = manager_with(Arc::new(StubEngine::default()));
        let uuid = mgr.create_kb(params()).await.unwrap();
        store
            .insert_file(FileRecord {
                uuid: "f-stale".into(),
                kb_id: uuid.clone(),
                file_name: "stale.txt".into(),
                extension: "txt".into(),
                status: FileStatus::Processing,
            })
            .await
            .unwrap();

        mgr.load_from_store().await.unwrap();
        let files = store.list_files(&uuid).await.unwrap();
        assert_eq!(files[0].status, FileStatus::Failed);
    }
}
