//! In-process [`BlobStore`] for tests and dry runs.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{validate_key, BlobStore};
use crate::error::BlobError;

const SCHEME: &str = "mem://";

#[derive(Debug, Clone)]
struct StoredBlob {
    bytes: Vec<u8>,
    content_type: String,
}

/// Keeps objects in a shared map; clones see the same objects.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    objects: Arc<Mutex<BTreeMap<String, StoredBlob>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored keys in lexical order.
    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects.lock().get(key).map(|b| b.content_type.clone())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String, BlobError> {
        validate_key(key)?;
        self.objects.lock().insert(
            key.to_string(),
            StoredBlob {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(format!("{SCHEME}{key}"))
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>, BlobError> {
        let key = url
            .strip_prefix(SCHEME)
            .ok_or_else(|| BlobError::NotFound(url.to_string()))?;
        self.objects
            .lock()
            .get(key)
            .map(|b| b.bytes.clone())
            .ok_or_else(|| BlobError::NotFound(url.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_key_same_url_single_object() {
        let store = MemoryBlobStore::new();
        let a = store.put("d/pages/0001.png", vec![1, 2], "image/png").await.unwrap();
        let b = store.put("d/pages/0001.png", vec![1, 2], "image/png").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&a).await.unwrap(), vec![1, 2]);
        assert_eq!(store.content_type("d/pages/0001.png").as_deref(), Some("image/png"));
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let err = MemoryBlobStore::new().get("mem://nope").await.unwrap_err();
        assert!(matches!(err, BlobError::NotFound(_)));
    }
}
