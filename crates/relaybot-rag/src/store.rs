//! Metadata-store gateway.
//!
//! Knowledge-base and file rows live in the relational collaborator; the
//! core only sees this async gateway. [`MemoryMetadataStore`] is the
//! in-process implementation used by tests and single-node deployments.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use relaybot_types::error::{RelayError, Result};

/// Ingestion status of an uploaded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// A `knowledge_bases` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBaseRecord {
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub embedding_model_uuid: String,
    /// Default result count for retrieval; callers may override per query.
    #[serde(default)]
    pub top_k: Option<usize>,
    /// The engine that owns ingestion and retrieval for this KB.
    pub rag_engine_plugin_id: String,
    /// Logical namespace inside the vector store; defaults to `uuid`.
    pub collection_id: String,
    /// Opaque settings surfaced through the engine's declared schema.
    #[serde(default)]
    pub creation_settings: serde_json::Value,
}

/// A `knowledge_base_files` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub uuid: String,
    pub kb_id: String,
    pub file_name: String,
    pub extension: String,
    pub status: FileStatus,
}

/// Async gateway over the relational rows the KB layer touches.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn insert_kb(&self, record: KnowledgeBaseRecord) -> Result<()>;
    async fn get_kb(&self, uuid: &str) -> Result<Option<KnowledgeBaseRecord>>;
    async fn list_kbs(&self) -> Result<Vec<KnowledgeBaseRecord>>;
    async fn delete_kb(&self, uuid: &str) -> Result<()>;

    async fn insert_file(&self, record: FileRecord) -> Result<()>;
    async fn update_file_status(&self, uuid: &str, status: FileStatus) -> Result<()>;
    async fn list_files(&self, kb_id: &str) -> Result<Vec<FileRecord>>;
    async fn delete_file(&self, uuid: &str) -> Result<()>;
}

/// DashMap-backed metadata store.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    kbs: DashMap<String, KnowledgeBaseRecord>,
    files: DashMap<String, FileRecord>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn insert_kb(&self, record: KnowledgeBaseRecord) -> Result<()> {
        self.kbs.insert(record.uuid.clone(), record);
        Ok(())
    }

    async fn get_kb(&self, uuid: &str) -> Result<Option<KnowledgeBaseRecord>> {
        Ok(self.kbs.get(uuid).map(|r| r.clone()))
    }

    async fn list_kbs(&self) -> Result<Vec<KnowledgeBaseRecord>> {
        Ok(self.kbs.iter().map(|r| r.clone()).collect())
    }

    async fn delete_kb(&self, uuid: &str) -> Result<()> {
        self.kbs.remove(uuid);
        self.files.retain(|_, f| f.kb_id != uuid);
        Ok(())
    }

    async fn insert_file(&self, record: FileRecord) -> Result<()> {
        self.files.insert(record.uuid.clone(), record);
        Ok(())
    }

    async fn update_file_status(&self, uuid: &str, status: FileStatus) -> Result<()> {
        match self.files.get_mut(uuid) {
            Some(mut record) => {
                record.status = status;
                Ok(())
            }
            None => Err(RelayError::NotFound(format!("file {uuid}"))),
        }
    }

    async fn list_files(&self, kb_id: &str) -> Result<Vec<FileRecord>> {
        Ok(self
            .files
            .iter()
            .filter(|r| r.kb_id == kb_id)
            .map(|r| r.clone())
            .collect())
    }

    async fn delete_file(&self, uuid: &str) -> Result<()> {
        self.files.remove(uuid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kb(uuid: &str) -> KnowledgeBaseRecord {
        KnowledgeBaseRecord {
            uuid: uuid.into(),
            name: "docs".into(),
            description: String::new(),
            embedding_model_uuid: "e1".into(),
            top_k: Some(5),
            rag_engine_plugin_id: "local".into(),
            collection_id: uuid.into(),
            creation_settings: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn kb_roundtrip_and_cascade_delete() {
        let store = MemoryMetadataStore::new();
        store.insert_kb(kb("k1")).await.unwrap();
        store
            .insert_file(FileRecord {
                uuid: "f1".into(),
                kb_id: "k1".into(),
                file_name: "a.txt".into(),
                extension: "txt".into(),
                status: FileStatus::Pending,
            })
            .await
            .unwrap();

        assert!(store.get_kb("k1").await.unwrap().is_some());
        assert_eq!(store.list_files("k1").await.unwrap().len(), 1);

        store.delete_kb("k1").await.unwrap();
        assert!(store.get_kb("k1").await.unwrap().is_none());
        assert!(store.list_files("k1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn status_transition() {
        let store = MemoryMetadataStore::new();
        store
            .insert_file(FileRecord {
                uuid: "f1".into(),
                kb_id: "k1".into(),
                file_name: "a.txt".into(),
                extension: "txt".into(),
                status: FileStatus::Pending,
            })
            .await
            .unwrap();
        store
            .update_file_status("f1", FileStatus::Completed)
            .await
            .unwrap();
        assert_eq!(
            store.list_files("k1").await.unwrap()[0].status,
            FileStatus::Completed
        );
        assert!(store
            .update_file_status("missing", FileStatus::Failed)
            .await
            .is_err());
    }
}
