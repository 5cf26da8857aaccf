//! One runtime knowledge base.
//!
//! Wraps a [`KnowledgeBaseRecord`] together with the engine that owns its
//! content. File ingestion runs as a background task that walks the
//! pending -> processing -> completed/failed status transitions; the
//! uploaded blob is deleted afterward in every case.

use std::io::{Cursor, Read};
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use relaybot_types::error::{RelayError, Result};
use relaybot_types::rag::RetrievalResultEntry;

use crate::engine::{IngestContext, RagEngine, RetrieveContext};
use crate::storage::ObjectStorage;
use crate::store::{FileRecord, FileStatus, MetadataStore};

/// Default result count when neither caller nor KB sets one.
const DEFAULT_TOP_K: usize = 5;

/// Inner file extensions accepted when expanding a ZIP upload.
const ZIP_SUPPORTED_EXTENSIONS: [&str; 5] = ["txt", "pdf", "docx", "md", "html"];

/// A knowledge base loaded into the runtime.
pub struct RuntimeKnowledgeBase {
    pub record: crate::store::KnowledgeBaseRecord,
    engine: Arc<dyn RagEngine>,
    store: Arc<dyn MetadataStore>,
    storage: Arc<dyn ObjectStorage>,
}

impl RuntimeKnowledgeBase {
    pub fn new(
        record: crate::store::KnowledgeBaseRecord,
        engine: Arc<dyn RagEngine>,
        store: Arc<dyn MetadataStore>,
        storage: Arc<dyn ObjectStorage>,
    ) -> Self {
        Self {
            record,
            engine,
            store,
            storage,
        }
    }

    pub fn engine(&self) -> &Arc<dyn RagEngine> {
        &self.engine
    }

    /// Accept an uploaded blob into this KB.
    ///
    /// ZIP archives are expanded and each supported member ingested
    /// individually. Returns the uuid of the (first) file row created;
    /// ingestion itself continues in the background.
    pub async fn store_file(&self, file_id: &str) -> Result<String> {
        if !self.storage.exists(file_id).await? {
            return Err(RelayError::NotFound(format!("file {file_id} not in storage")));
        }

        let extension = extension_of(file_id);
        if extension == "zip" {
            return self.store_zip_file(file_id).await;
        }
        self.store_single_file(file_id).await
    }

    /// Persist a pending file row and start the background ingest task.
    async fn store_single_file(&self, file_id: &str) -> Result<String> {
        let file_uuid = Uuid::new_v4().to_string();
        let record = FileRecord {
            uuid: file_uuid.clone(),
            kb_id: self.record.uuid.clone(),
            file_name: file_id.to_string(),
            extension: extension_of(file_id),
            status: FileStatus::Pending,
        };
        self.store.insert_file(record.clone()).await?;

        let engine = self.engine.clone();
        let store = self.store.clone();
        let storage = self.storage.clone();
        let context = IngestContext {
            document_id: file_uuid.clone(),
            file_name: record.file_name.clone(),
            extension: record.extension.clone(),
            storage_path: file_id.to_string(),
            kb_id: self.record.uuid.clone(),
            collection_id: self.record.collection_id.clone(),
            chunking_strategy: self
                .record
                .creation_settings
                .get("chunking_strategy")
                .and_then(|v| v.as_str())
                .unwrap_or("fixed_size")
                .to_string(),
            embedding_model_uuid: self.record.embedding_model_uuid.clone(),
        };

        tokio::spawn(async move {
            run_ingest_task(engine, store, storage, context).await;
        });

        Ok(file_uuid)
    }

    /// Expand a ZIP upload: each supported member becomes its own file.
    async fn store_zip_file(&self, zip_file_id: &str) -> Result<String> {
        info!(kb_id = %self.record.uuid, zip = %zip_file_id, "expanding zip upload");
        let zip_bytes = self.storage.load(zip_file_id).await?;

        // Extraction is blocking work on an in-memory cursor.
        let members = tokio::task::spawn_blocking(move || extract_zip_members(&zip_bytes))
            .await
            .map_err(|e| RelayError::Storage(format!("zip task failed: {e}")))??;

        let mut stored = Vec::new();
        for (member_name, content) in members {
            let extension = extension_of(&member_name);
            let base = member_name
                .replace(['/', '\\'], "_")
                .trim_end_matches(&format!(".{extension}"))
                .to_string();
            let extracted_id = format!(
                "{base}_{}.{extension}",
                &Uuid::new_v4().to_string()[..8]
            );
            if let Err(e) = self.storage.save(&extracted_id, &content).await {
                warn!(member = %member_name, error = %e, "failed to save zip member");
                continue;
            }
            match self.store_single_file(&extracted_id).await {
                Ok(uuid) => {
                    debug!(member = %member_name, file = %extracted_id, "stored zip member");
                    stored.push(uuid);
                }
                Err(e) => warn!(member = %member_name, error = %e, "failed to store zip member"),
            }
        }

        if stored.is_empty() {
            return Err(RelayError::Storage(
                "No supported files found in ZIP archive".into(),
            ));
        }

        info!(kb_id = %self.record.uuid, files = stored.len(), "zip expanded");
        self.storage.delete(zip_file_id).await?;
        Ok(stored.swap_remove(0))
    }

    /// Retrieve entries; effective top-k is override > KB default > 5.
    pub async fn retrieve(
        &self,
        query: &str,
        top_k_override: Option<usize>,
        retrieval_settings: serde_json::Value,
    ) -> Result<Vec<RetrievalResultEntry>> {
        let top_k = top_k_override
            .or(self.record.top_k)
            .unwrap_or(DEFAULT_TOP_K);
        self.engine
            .retrieve(RetrieveContext {
                query: query.to_string(),
                kb_id: self.record.uuid.clone(),
                collection_id: self.record.collection_id.clone(),
                top_k,
                retrieval_settings,
                creation_settings: self.record.creation_settings.clone(),
                embedding_model_uuid: self.record.embedding_model_uuid.clone(),
            })
            .await
    }

    /// Remove one file: engine first, then the metadata row.
    pub async fn delete_file(&self, file_id: &str) -> Result<()> {
        self.engine
            .delete_document(file_id, &self.record.uuid)
            .await?;
        self.store.delete_file(file_id).await
    }
}

/// The background ingestion task body.
async fn run_ingest_task(
    engine: Arc<dyn RagEngine>,
    store: Arc<dyn MetadataStore>,
    storage: Arc<dyn ObjectStorage>,
    context: IngestContext,
) {
    let file_uuid = context.document_id.clone();
    let storage_path = context.storage_path.clone();

    if let Err(e) = store
        .update_file_status(&file_uuid, FileStatus::Processing)
        .await
    {
        error!(file = %file_uuid, error = %e, "failed to mark file processing");
    }

    let outcome = engine.ingest(context).await;
    let status = match &outcome {
        Ok(()) => FileStatus::Completed,
        Err(e) => {
            error!(file = %file_uuid, error = %e, "document ingestion failed");
            FileStatus::Failed
        }
    };
    if let Err(e) = store.update_file_status(&file_uuid, status).await {
        error!(file = %file_uuid, error = %e, "failed to record ingest outcome");
    }

    // The blob is deleted whether ingestion succeeded or not.
    if let Err(e) = storage.delete(&storage_path).await {
        warn!(blob = %storage_path, error = %e, "failed to delete ingested blob");
    }
}

fn extension_of(name: &str) -> String {
    name.rsplit('.').next().unwrap_or_default().to_lowercase()
}

/// Pull supported members out of a ZIP archive.
///
/// Directories, hidden entries, Apple `__MACOSX` metadata, and unsupported
/// extensions are skipped.
fn extract_zip_members(bytes: &[u8]) -> Result<Vec<(String, Vec<u8>)>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| RelayError::Storage(format!("invalid zip archive: {e}")))?;

    let mut members = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| RelayError::Storage(format!("zip entry {i}: {e}")))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let base_name = name.rsplit('/').next().unwrap_or(&name);
        if base_name.starts_with('.') || name.starts_with("__MACOSX") {
            continue;
        }
        let extension = extension_of(&name);
        if !ZIP_SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
            debug!(member = %name, "skipping unsupported file in zip");
            continue;
        }
        let mut content = Vec::new();
        if let Err(e) = entry.read_to_end(&mut content) {
            warn!(member = %name, error = %e, "failed to read zip member");
            continue;
        }
        members.push((name, content));
    }
    Ok(members)
}
