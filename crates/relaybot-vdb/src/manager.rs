//! The vector-database manager.
//!
//! Builds backend instances from the three accepted config shapes, shares
//! instances of the same type, and exposes normalized high-level
//! operations for upstream consumers that do not care about the
//! batch-of-one wire shape.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use relaybot_types::config::{VdbConfig, VdbDatabases, VdbEntry};
use relaybot_types::error::{RelayError, Result};

use crate::database::VectorDatabase;
use crate::memory::MemoryVectorDatabase;
use crate::remote::RemoteVectorDatabase;

/// A flat search hit handed to upstream consumers.
#[derive(Debug, Clone)]
pub struct NormalizedHit {
    pub id: String,
    pub score: f32,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Owns one [`VectorDatabase`] instance per configured backend.
pub struct VdbManager {
    /// Name -> backend. Insertion order preserved separately for `default()`.
    databases: HashMap<String, Arc<dyn VectorDatabase>>,
    order: Vec<String>,
}

impl VdbManager {
    /// Instantiate backends from config.
    ///
    /// Accepted shapes: `use = <type>`; `databases = [<type>, ...]`
    /// (instances of the same type shared); `databases = {name: {type, ...}}`.
    pub fn from_config(config: &VdbConfig) -> Result<Self> {
        let mut databases: HashMap<String, Arc<dyn VectorDatabase>> = HashMap::new();
        let mut order = Vec::new();
        let mut shared_by_type: HashMap<String, Arc<dyn VectorDatabase>> = HashMap::new();

        let mut add = |name: String,
                       db: Arc<dyn VectorDatabase>,
                       databases: &mut HashMap<String, Arc<dyn VectorDatabase>>,
                       order: &mut Vec<String>| {
            info!(name = %name, backend = db.name(), "registered vector database");
            databases.insert(name.clone(), db);
            order.push(name);
        };

        match (&config.use_backend, &config.databases) {
            (Some(backend_type), _) => {
                let db = build_backend(backend_type, &serde_json::Map::new())?;
                add("default".into(), db, &mut databases, &mut order);
            }
            (None, Some(VdbDatabases::Types(types))) => {
                for backend_type in types {
                    let db = match shared_by_type.get(backend_type) {
                        Some(existing) => existing.clone(),
                        None => {
                            let db = build_backend(backend_type, &serde_json::Map::new())?;
                            shared_by_type.insert(backend_type.clone(), db.clone());
                            db
                        }
                    };
                    add(backend_type.clone(), db, &mut databases, &mut order);
                }
            }
            (None, Some(VdbDatabases::Named(entries))) => {
                for (name, entry) in entries {
                    let db = build_backend(&entry.backend_type, &entry.settings)?;
                    add(name.clone(), db, &mut databases, &mut order);
                }
            }
            (None, None) => {}
        }

        Ok(Self { databases, order })
    }

    /// Manager with a single in-memory backend; used by tests and as the
    /// zero-config fallback.
    pub fn in_memory() -> Self {
        let db: Arc<dyn VectorDatabase> = Arc::new(MemoryVectorDatabase::new());
        Self {
            databases: [("default".to_string(), db)].into_iter().collect(),
            order: vec!["default".into()],
        }
    }

    /// Look up a backend by configured name.
    pub fn get_db(&self, name: &str) -> Option<Arc<dyn VectorDatabase>> {
        self.databases.get(name).cloned()
    }

    /// The backend named `default`, else the first configured one.
    pub fn default_db(&self) -> Option<Arc<dyn VectorDatabase>> {
        self.get_db("default")
            .or_else(|| self.order.first().and_then(|n| self.get_db(n)))
    }

    fn require_default(&self) -> Result<Arc<dyn VectorDatabase>> {
        self.default_db()
            .ok_or_else(|| RelayError::NotFound("no vector database configured".into()))
    }

    /// Upsert rows through the default backend.
    pub async fn upsert(
        &self,
        collection: &str,
        ids: &[String],
        vectors: &[Vec<f32>],
        metadatas: &[serde_json::Map<String, serde_json::Value>],
        documents: Option<&[String]>,
    ) -> Result<()> {
        let db = self.require_default()?;
        db.get_or_create_collection(collection).await?;
        db.add_embeddings(collection, ids, vectors, metadatas, documents)
            .await
    }

    /// Search through the default backend, flattening to [`NormalizedHit`]s.
    ///
    /// `score` is `1 - distance`, so larger is better for consumers.
    pub async fn search(
        &self,
        collection: &str,
        query_vector: &[f32],
        k: usize,
    ) -> Result<Vec<NormalizedHit>> {
        let db = self.require_default()?;
        let results = db.search(collection, query_vector, k).await?;
        let ids = results.ids.into_iter().next().unwrap_or_default();
        let distances = results.distances.into_iter().next().unwrap_or_default();
        let metadatas = results.metadatas.into_iter().next().unwrap_or_default();
        Ok(ids
            .into_iter()
            .enumerate()
            .map(|(i, id)| NormalizedHit {
                id,
                score: 1.0 - distances.get(i).copied().unwrap_or(1.0),
                metadata: metadatas.get(i).cloned().unwrap_or_default(),
            })
            .collect())
    }

    pub async fn delete_by_file_id(&self, collection: &str, file_id: &str) -> Result<()> {
        self.require_default()?
            .delete_by_file_id(collection, file_id)
            .await
    }

    pub async fn delete_collection(&self, collection: &str) -> Result<()> {
        self.require_default()?.delete_collection(collection).await
    }

    /// Arbitrary filter-based deletion is not part of the contract.
    pub async fn delete_by_filter(
        &self,
        _collection: &str,
        _filter: &serde_json::Value,
    ) -> Result<()> {
        Err(RelayError::VectorStore {
            provider: "manager".into(),
            message: "filter-based deletion is not supported".into(),
        })
    }
}

fn build_backend(
    backend_type: &str,
    settings: &serde_json::Map<String, serde_json::Value>,
) -> Result<Arc<dyn VectorDatabase>> {
    match backend_type {
        "memory" => Ok(Arc::new(MemoryVectorDatabase::new())),
        "remote" => Ok(Arc::new(RemoteVectorDatabase::from_settings(settings)?)),
        other => Err(RelayError::ConfigInvalid {
            reason: format!("unknown vector database type {other:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaybot_types::config::AppConfig;

    #[test]
    fn use_shape_builds_default() {
        let cfg = AppConfig::from_toml_str("[vdb]\nuse = \"memory\"\n").unwrap();
        let mgr = VdbManager::from_config(&cfg.vdb).unwrap();
        assert!(mgr.get_db("default").is_some());
        assert!(mgr.default_db().is_some());
    }

    #[test]
    fn list_shape_shares_same_type() {
        let cfg =
            AppConfig::from_toml_str("[vdb]\ndatabases = [\"memory\", \"memory\"]\n").unwrap();
        let mgr = VdbManager::from_config(&cfg.vdb).unwrap();
        // Both names resolve to the same shared instance.
        let a = mgr.get_db("memory").unwrap();
        let b = mgr.default_db().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn named_shape_builds_each_entry() {
        let cfg = AppConfig::from_toml_str(
            "[vdb.databases.main]\ntype = \"memory\"\n[vdb.databases.default]\ntype = \"memory\"\n",
        )
        .unwrap();
        let mgr = VdbManager::from_config(&cfg.vdb).unwrap();
        assert!(mgr.get_db("main").is_some());
        // Explicit "default" entry wins the default accessor.
        let d = mgr.default_db().unwrap();
        assert!(Arc::ptr_eq(&d, &mgr.get_db("default").unwrap()));
    }

    #[test]
    fn unknown_type_is_config_error() {
        let cfg = AppConfig::from_toml_str("[vdb]\nuse = \"chroma\"\n").unwrap();
        assert!(matches!(
            VdbManager::from_config(&cfg.vdb),
            Err(RelayError::ConfigInvalid { .. })
        ));
    }

    #[tokio::test]
    async fn high_level_roundtrip_normalizes() {
        let mgr = VdbManager::in_memory();
        mgr.upsert(
            "kb",
            &["a".into(), "b".into()],
            &[vec![1.0, 0.0], vec![0.0, 1.0]],
            &[Default::default(), Default::default()],
            Some(&["alpha".into(), "beta".into()]),
        )
        .await
        .unwrap();

        let hits = mgr.search("kb", &[1.0, 0.0], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "a");
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn filter_deletion_unsupported() {
        let mgr = VdbManager::in_memory();
        let err = mgr
            .delete_by_filter("kb", &serde_json::json!({"any": "filter"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }

    #[tokio::test]
    async fn empty_config_has_no_default() {
        let mgr = VdbManager::from_config(&Default::default()).unwrap();
        assert!(mgr.default_db().is_none());
        assert!(matches!(
            mgr.search("kb", &[1.0], 1).await,
            Err(RelayError::NotFound(_))
        ));
    }
}
