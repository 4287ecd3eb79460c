//! Error types for the edgequake-pdfpages library.
//!
//! Two distinct error types reflect two distinct failure scopes:
//!
//! * [`PipelineError`] (**job-level**): the job cannot make progress (source
//!   unreachable, malformed PDF, storage write failed during finalisation).
//!   The worker records it on the document and hands it to the queue's
//!   `fail`, where [`PipelineError::is_retryable`] decides between a delayed
//!   retry and the dead-letter set.
//!
//! * [`PageError`] (**page-level**): one page failed to render or upload but
//!   every other page is fine. Stored inside [`crate::output::PageResult`]
//!   and never propagated to the orchestrator.
//!
//! The port errors ([`StoreError`], [`BlobError`], [`FetchError`],
//! [`ExtractError`], [`RenderError`]) are what the individual collaborators
//! return; each converts into the job-level taxonomy.

use thiserror::Error;

/// All job-level errors returned by the pipeline.
///
/// Page-level failures use [`PageError`] and are recorded in
/// [`crate::output::PageResult`] rather than propagated here.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Queue errors ──────────────────────────────────────────────────────
    /// The backing store of the job queue could not be reached.
    #[error("Job queue unavailable: {0}")]
    QueueUnavailable(String),

    /// The job descriptor was rejected at enqueue time.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// No job with the given id exists.
    #[error("Job '{0}' not found")]
    JobNotFound(String),

    /// The caller no longer holds the lease on this job.
    #[error("Lease on job '{job_id}' is not held by worker '{worker_id}'")]
    LeaseLost { job_id: String, worker_id: String },

    // ── Source errors ─────────────────────────────────────────────────────
    /// Fetching the original PDF failed (network, storage, non-2xx).
    #[error("Source unavailable: fetch of '{url}' failed: {reason}")]
    SourceUnavailable { url: String, reason: String },

    /// The bytes are not a PDF the extractor can parse. Never retried.
    #[error("Malformed document: {0}")]
    MalformedDocument(String),

    /// The extraction engine itself failed (library missing, task panicked).
    #[error("Extraction failed: {0}")]
    ExtractionFailed(String),

    // ── Finalisation errors ───────────────────────────────────────────────
    /// Writing the aggregate result or the document record failed.
    #[error("Storage write failed: {0}")]
    StorageWriteFailed(String),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Whether another attempt of the whole job could plausibly succeed.
    ///
    /// `MalformedDocument` is a deterministic property of the bytes and
    /// `InvalidJob` of the descriptor; everything else is infrastructure.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            PipelineError::MalformedDocument(_)
                | PipelineError::InvalidJob(_)
                | PipelineError::InvalidConfig(_)
        )
    }

    /// Short machine-readable kind, used in logs and dead-letter reasons.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::QueueUnavailable(_) => "queue_unavailable",
            PipelineError::InvalidJob(_) => "invalid_job",
            PipelineError::JobNotFound(_) => "job_not_found",
            PipelineError::LeaseLost { .. } => "lease_lost",
            PipelineError::SourceUnavailable { .. } => "source_unavailable",
            PipelineError::MalformedDocument(_) => "malformed_document",
            PipelineError::ExtractionFailed(_) => "extraction_failed",
            PipelineError::StorageWriteFailed(_) => "storage_write_failed",
            PipelineError::InvalidConfig(_) => "invalid_config",
            PipelineError::Internal(_) => "internal",
        }
    }
}

/// A non-fatal error for a single page.
///
/// Stored alongside [`crate::output::PageResult`] when a page fails.
/// The job continues to `Finalizing` regardless.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PageError {
    /// Page rasterisation failed. Deterministic, so never retried.
    #[error("Page {page}: rendering failed: {detail}")]
    RenderFailed { page: usize, detail: String },

    /// Upload to the blob store failed after all retries.
    #[error("Page {page}: upload failed after {attempts} attempts: {detail}")]
    UploadFailed {
        page: usize,
        attempts: u32,
        detail: String,
    },
}

/// Errors from the job queue and document record stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("lease on job '{job_id}' is not held by '{worker_id}'")]
    LeaseConflict { job_id: String, worker_id: String },
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

impl From<StoreError> for PipelineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => PipelineError::QueueUnavailable(msg),
            StoreError::NotFound(id) => PipelineError::JobNotFound(id),
            StoreError::InvalidInput(msg) => PipelineError::InvalidJob(msg),
            StoreError::LeaseConflict { job_id, worker_id } => {
                PipelineError::LeaseLost { job_id, worker_id }
            }
        }
    }
}

/// Errors from a [`crate::blob::BlobStore`].
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("invalid blob key '{0}'")]
    InvalidKey(String),
    #[error("blob not found: {0}")]
    NotFound(String),
    #[error("blob write failed for '{key}': {reason}")]
    WriteFailed { key: String, reason: String },
    #[error("blob read failed for '{url}': {reason}")]
    ReadFailed { url: String, reason: String },
}

/// Errors from a [`crate::pipeline::fetch::SourceFetcher`].
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP {status} from '{url}'")]
    Status { url: String, status: u16 },
    #[error("request to '{url}' failed: {reason}")]
    Transport { url: String, reason: String },
    #[error("request to '{url}' timed out after {secs}s")]
    Timeout { url: String, secs: u64 },
    #[error("unsupported source URL '{0}'")]
    UnsupportedScheme(String),
}

impl FetchError {
    pub fn url(&self) -> &str {
        match self {
            FetchError::Status { url, .. }
            | FetchError::Transport { url, .. }
            | FetchError::Timeout { url, .. } => url,
            FetchError::UnsupportedScheme(url) => url,
        }
    }
}

impl From<FetchError> for PipelineError {
    fn from(e: FetchError) -> Self {
        PipelineError::SourceUnavailable {
            url: e.url().to_string(),
            reason: e.to_string(),
        }
    }
}

/// Errors from a [`crate::pipeline::extract::PageExtractor`].
#[derive(Debug, Error)]
pub enum ExtractError {
    /// The input is not a parseable PDF. Non-retryable.
    #[error("malformed PDF: {0}")]
    Malformed(String),
    /// The extraction engine failed independently of the input.
    #[error("extraction engine error: {0}")]
    Engine(String),
}

impl From<ExtractError> for PipelineError {
    fn from(e: ExtractError) -> Self {
        match e {
            ExtractError::Malformed(detail) => PipelineError::MalformedDocument(detail),
            ExtractError::Engine(detail) => PipelineError::ExtractionFailed(detail),
        }
    }
}

/// Error from a [`crate::pipeline::render::PageRenderer`].
#[derive(Debug, Error)]
#[error("{0}")]
pub struct RenderError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_is_not_retryable() {
        assert!(!PipelineError::MalformedDocument("bad xref".into()).is_retryable());
        assert!(!PipelineError::InvalidJob("empty id".into()).is_retryable());
    }

    #[test]
    fn infrastructure_errors_are_retryable() {
        let e = PipelineError::SourceUnavailable {
            url: "https://x/doc.pdf".into(),
            reason: "HTTP 404".into(),
        };
        assert!(e.is_retryable());
        assert!(PipelineError::StorageWriteFailed("disk full".into()).is_retryable());
        assert!(PipelineError::ExtractionFailed("no pdfium".into()).is_retryable());
    }

    #[test]
    fn fetch_status_maps_to_source_unavailable() {
        let e: PipelineError = FetchError::Status {
            url: "https://x/doc.pdf".into(),
            status: 404,
        }
        .into();
        let msg = e.to_string();
        assert!(msg.contains("fetch"), "got: {msg}");
        assert!(msg.contains("404"), "got: {msg}");
        assert_eq!(e.kind(), "source_unavailable");
    }

    #[test]
    fn extract_errors_keep_their_class() {
        let e: PipelineError = ExtractError::Malformed("no %PDF header".into()).into();
        assert!(matches!(e, PipelineError::MalformedDocument(_)));
        let e: PipelineError = ExtractError::Engine("bind failed".into()).into();
        assert!(matches!(e, PipelineError::ExtractionFailed(_)));
    }

    #[test]
    fn page_error_serialises_with_kind_tag() {
        let e = PageError::UploadFailed {
            page: 3,
            attempts: 4,
            detail: "connection reset".into(),
        };
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["kind"], "upload_failed");
        assert_eq!(json["page"], 3);
        assert!(e.to_string().contains("4 attempts"));
    }
}
