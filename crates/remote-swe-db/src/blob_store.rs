use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use remote_swe_common::{Error, Result};
use tracing::debug;

/// Content-addressed binary storage for offloaded message payloads.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data` under `key`. Writing the same key twice is a no-op.
    async fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Vec<u8>>;
}

/// Blob store backed by a local directory. Keys map to relative paths.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(Error::Blob(format!("invalid blob key '{key}'")));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!("blob {key} already stored");
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Blob(format!("failed to create {}: {e}", parent.display())))?;
        }
        // Write to a sibling temp file first so readers never see a partial blob.
        let tmp = path.with_extension("partial");
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| Error::Blob(format!("failed to write blob {key}: {e}")))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::Blob(format!("failed to commit blob {key}: {e}")))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| Error::Blob(format!("failed to read blob {key}: {e}")))
    }
}
