//! Knowledge-base management.
//!
//! A knowledge base is owned by exactly one RAG engine (usually a plugin);
//! the platform owns only collection identity and file metadata. This
//! crate provides the KB lifecycle (create / ingest / retrieve / delete),
//! the object-storage and metadata-store gateways, and a built-in
//! [`LocalRagEngine`](engine::LocalRagEngine) for deployments without an
//! external engine plugin.

pub mod engine;
pub mod kb;
pub mod manager;
pub mod storage;
pub mod store;

pub use engine::{IngestContext, LocalRagEngine, RagEngine, RetrieveContext};
pub use kb::RuntimeKnowledgeBase;
pub use manager::{CreateKbParams, KnowledgeBaseManager};
pub use storage::{LocalStorage, ObjectStorage};
pub use store::{FileRecord, FileStatus, KnowledgeBaseRecord, MemoryMetadataStore, MetadataStore};
