//! Object storage for uploaded frames.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::error::{Error, Result};

/// Stores frame images by media unit id.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write `data` under `id`. Returns the path workers read it from.
    async fn put(&self, id: &str, data: Bytes) -> Result<String>;

    /// Read back the bytes at `path`.
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// A link clients can download `path` from directly, if the backend
    /// offers one.
    fn download_url(&self, _path: &str) -> Option<String> {
        None
    }
}

/// Blob store writing `{dir}/{id}.jpg` on the local filesystem.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    dir: PathBuf,
}

impl FsBlobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Create the directory if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let store = Self::new(dir);
        tokio::fs::create_dir_all(&store.dir).await?;
        Ok(store)
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(Error::Blob(format!("invalid blob id: {:?}", id)));
        }
        Ok(self.dir.join(format!("{}.jpg", id)))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, id: &str, data: Bytes) -> Result<String> {
        let path = self.path_for(id)?;
        tokio::fs::write(&path, &data)
            .await
            .map_err(|e| Error::Blob(format!("{}: {}", path.display(), e)))?;
        debug!(path = %path.display(), size = data.len(), "blob written");
        Ok(path.to_string_lossy().into_owned())
    }

    async fn get(&self, path: &str) -> Result<Bytes> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| Error::Blob(format!("{}: {}", path, e)))?;
        Ok(Bytes::from(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path().join("files")).await.unwrap();

        let path = store.put("mu-1", Bytes::from_static(b"\xff\xd8jpeg")).await.unwrap();
        assert!(path.ends_with("mu-1.jpg"));
        assert_eq!(store.get(&path).await.unwrap(), Bytes::from_static(b"\xff\xd8jpeg"));
        assert!(store.download_url(&path).is_none());
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        assert!(matches!(
            store.put("../escape", Bytes::new()).await,
            Err(Error::Blob(_))
        ));
        assert!(store.put("", Bytes::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_blob_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        let missing = dir.path().join("nope.jpg");
        assert!(store.get(missing.to_str().unwrap()).await.is_err());
    }
}
