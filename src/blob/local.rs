//! Filesystem [`BlobStore`].

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

use super::{validate_key, BlobStore};
use crate::error::BlobError;

/// Stores objects as files under a root directory.
///
/// URLs are `file://` URLs of the stored files unless a public base URL is
/// configured (e.g. a static file server in front of the root), in which
/// case they are `{base_url}/{key}`. Keys are built from document ids, which
/// are limited to URL-safe characters, so keys are appended unescaped.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
    base_url: Option<String>,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, BlobError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| BlobError::WriteFailed {
            key: root.display().to_string(),
            reason: e.to_string(),
        })?;
        // Absolute root so file:// URLs are valid from any working directory.
        let root = root.canonicalize().map_err(|e| BlobError::WriteFailed {
            key: root.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            root,
            base_url: None,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into().trim_end_matches('/').to_string());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn url_for(&self, key: &str) -> String {
        match &self.base_url {
            Some(base) => format!("{base}/{key}"),
            None => format!("file://{}", self.path_for(key).display()),
        }
    }

    /// Map a URL produced by this store back to its key.
    fn key_for(&self, url: &str) -> Result<String, BlobError> {
        let not_ours = || BlobError::NotFound(url.to_string());
        let key = match &self.base_url {
            Some(base) => url
                .strip_prefix(base.as_str())
                .and_then(|rest| rest.strip_prefix('/'))
                .ok_or_else(not_ours)?
                .to_string(),
            None => {
                let path = url.strip_prefix("file://").ok_or_else(not_ours)?;
                Path::new(path)
                    .strip_prefix(&self.root)
                    .map_err(|_| not_ours())?
                    .to_string_lossy()
                    .replace('\\', "/")
            }
        };
        validate_key(&key)?;
        Ok(key)
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> Result<String, BlobError> {
        validate_key(key)?;
        let path = self.path_for(key);
        let write_err = |e: std::io::Error| BlobError::WriteFailed {
            key: key.to_string(),
            reason: e.to_string(),
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }

        // Atomic write: unique temp file, then rename over the final name.
        let tmp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        tokio::fs::write(&tmp_path, &bytes).await.map_err(write_err)?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(write_err(e));
        }

        debug!(key, bytes = bytes.len(), "Blob written");
        Ok(self.url_for(key))
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>, BlobError> {
        let key = self.key_for(url)?;
        match tokio::fs::read(self.path_for(&key)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(url.to_string()))
            }
            Err(e) => Err(BlobError::ReadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}
