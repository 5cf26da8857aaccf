//! Object storage gateway for uploaded file blobs.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use relaybot_types::error::{RelayError, Result};

/// Blob storage keyed by file name.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn save(&self, key: &str, data: &[u8]) -> Result<()>;
    async fn load(&self, key: &str) -> Result<Vec<u8>>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Blob storage under a base directory on the local filesystem.
pub struct LocalStorage {
    base_dir: PathBuf,
}

impl LocalStorage {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Resolve a key, rejecting path traversal.
    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let name = Path::new(key);
        if name.components().any(|c| {
            matches!(
                c,
                std::path::Component::ParentDir | std::path::Component::RootDir
            )
        }) {
            return Err(RelayError::Storage(format!("invalid storage key {key:?}")));
        }
        Ok(self.base_dir.join(name))
    }
}

#[async_trait]
impl ObjectStorage for LocalStorage {
    async fn save(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, data).await?;
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| RelayError::Storage(format!("load {key:?}: {e}")))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::try_exists(path).await.unwrap_or(false))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RelayError::Storage(format!("delete {key:?}: {e}"))),
        }
    }
}
