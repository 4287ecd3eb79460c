//! Artifact upload: put a rendered page into the blob store with retries.
//!
//! Blob stores fail transiently under load (throttling, connection resets).
//! Each upload is retried with the worker's upload [`BackoffPolicy`]; with a
//! 500 ms base and 3 retries the wait sequence is 500 ms → 1 s → 2 s. Keys
//! are deterministic per page, so a retry (or a whole-job redelivery)
//! overwrites the same object instead of leaving duplicates.

use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::blob::{page_image_key, BlobStore, PNG_CONTENT_TYPE};
use crate::error::{BlobError, PageError};
use crate::retry::{retry_with_backoff, BackoffPolicy};

/// Uploads page images for one worker.
#[derive(Clone)]
pub struct ArtifactUploader {
    blob: Arc<dyn BlobStore>,
    policy: BackoffPolicy,
}

impl ArtifactUploader {
    pub fn new(blob: Arc<dyn BlobStore>, policy: BackoffPolicy) -> Self {
        Self { blob, policy }
    }

    /// Upload one page image; returns its URL.
    ///
    /// Never panics and never returns a job-level error: exhaustion becomes
    /// [`PageError::UploadFailed`] on that page only.
    pub async fn upload_page(
        &self,
        document_id: &str,
        page_number: usize,
        png: Vec<u8>,
    ) -> Result<String, PageError> {
        let key = page_image_key(document_id, page_number);
        self.upload(&key, page_number, png, PNG_CONTENT_TYPE).await
    }

    /// Upload `bytes` under `key`, retrying transient failures.
    pub async fn upload(
        &self,
        key: &str,
        page_number: usize,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, PageError> {
        let start = Instant::now();
        let label = format!("Page {page_number} upload");
        let result = retry_with_backoff(&self.policy, &label, is_transient, || {
            self.blob.put(key, bytes.clone(), content_type)
        })
        .await;

        match result {
            Ok(url) => {
                debug!("Page {}: uploaded {} in {:?}", page_number, key, start.elapsed());
                Ok(url)
            }
            Err(exhausted) => Err(PageError::UploadFailed {
                page: page_number,
                attempts: exhausted.attempts,
                detail: exhausted.last_error.to_string(),
            }),
        }
    }
}

/// A malformed key will fail the same way every time.
fn is_transient(e: &BlobError) -> bool {
    !matches!(e, BlobError::InvalidKey(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Fails the first `failures` puts, then delegates.
    struct Flaky {
        inner: MemoryBlobStore,
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl BlobStore for Flaky {
        async fn put(&self, key: &str, bytes: Vec<u8>, ct: &str) -> Result<String, BlobError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(BlobError::WriteFailed {
                    key: key.into(),
                    reason: "503 slow down".into(),
                });
            }
            self.inner.put(key, bytes, ct).await
        }

        async fn get(&self, url: &str) -> Result<Vec<u8>, BlobError> {
            self.inner.get(url).await
        }
    }

    fn policy(retries: u32) -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(1), retries)
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let flaky = Arc::new(Flaky {
            inner: MemoryBlobStore::new(),
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let up = ArtifactUploader::new(flaky.clone(), policy(3));
        let url = up.upload_page("doc", 3, vec![9]).await.unwrap();
        assert_eq!(url, "mem://doc/pages/0003.png");
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_becomes_page_error() {
        let flaky = Arc::new(Flaky {
            inner: MemoryBlobStore::new(),
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let up = ArtifactUploader::new(flaky.clone(), policy(2));
        let err = up.upload_page("doc", 1, vec![9]).await.unwrap_err();
        assert_eq!(
            err,
            PageError::UploadFailed {
                page: 1,
                attempts: 3,
                detail: "blob write failed for 'doc/pages/0001.png': 503 slow down".into(),
            }
        );
    }

    #[tokio::test]
    async fn invalid_key_is_not_retried() {
        let store = Arc::new(MemoryBlobStore::new());
        let up = ArtifactUploader::new(store, policy(5));
        let err = up.upload("../x", 1, vec![1], PNG_CONTENT_TYPE).await.unwrap_err();
        assert!(matches!(err, PageError::UploadFailed { attempts: 1, .. }));
    }
}
