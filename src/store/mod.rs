//! Document record store: the processing-state fields clients poll.

mod sqlite;

pub use sqlite::SqliteDocumentStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::job::DocumentId;

/// Client-visible processing state of one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingState {
    /// 0–100; never decreases.
    pub progress: u8,
    pub complete: bool,
    /// Last job-level error; cleared when a new attempt starts.
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_url: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Storage for [`ProcessingState`], keyed by document.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Start of an attempt: create the record if needed, clear `error`
    /// and `complete`. Progress is kept.
    async fn begin_run(&self, doc: &DocumentId) -> Result<(), StoreError>;

    /// Raise progress to `progress`; lower values are ignored.
    async fn set_progress(&self, doc: &DocumentId, progress: u8) -> Result<(), StoreError>;

    /// Terminal success: `progress = 100`, `complete = true`.
    async fn mark_complete(
        &self,
        doc: &DocumentId,
        page_count: usize,
        artifact_url: &str,
    ) -> Result<(), StoreError>;

    /// Record a job-level error. Never sets `complete`.
    async fn mark_failed(&self, doc: &DocumentId, error: &str) -> Result<(), StoreError>;

    async fn processing_state(&self, doc: &DocumentId) -> Result<Option<ProcessingState>, StoreError>;
}
