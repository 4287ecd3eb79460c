//! Blob storage for page images and document artifacts.
//!
//! Writes are idempotent per key: putting the same key twice leaves one
//! object (the last bytes written) and returns the same URL both times.
//! Concurrent writers of one key never leave a torn object behind.

mod local;
mod memory;

pub use local::LocalBlobStore;
pub use memory::MemoryBlobStore;

use async_trait::async_trait;

use crate::error::BlobError;

pub const PNG_CONTENT_TYPE: &str = "image/png";
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Key/URL addressed object storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `key` and return the object's URL.
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String, BlobError>;

    /// Fetch an object by the URL `put` returned.
    async fn get(&self, url: &str) -> Result<Vec<u8>, BlobError>;
}

/// Object key of a rendered page image: `{documentId}/pages/{pageNumber:04}.png`.
pub fn page_image_key(document_id: &str, page_number: usize) -> String {
    format!("{document_id}/pages/{page_number:04}.png")
}

/// Object key of the aggregate artifact: `{documentId}/document.json`.
pub fn artifact_key(document_id: &str) -> String {
    format!("{document_id}/document.json")
}

/// Reject keys that are empty or could escape the store's namespace.
pub(crate) fn validate_key(key: &str) -> Result<(), BlobError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        return Err(BlobError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_keys_are_zero_padded() {
        assert_eq!(page_image_key("doc", 7), "doc/pages/0007.png");
        assert_eq!(page_image_key("doc", 12345), "doc/pages/12345.png");
        assert_eq!(artifact_key("doc"), "doc/document.json");
    }

    #[test]
    fn traversal_keys_are_rejected() {
        for key in ["", "/abs", "a/../b", "a//b", "a\\b", "./a"] {
            assert!(validate_key(key).is_err(), "{key:?}");
        }
        assert!(validate_key("doc/pages/0001.png").is_ok());
    }
}
