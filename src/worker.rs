//! One job's journey through the pipeline.
//!
//! ```text
//! Claimed ──▶ Extracting ──▶ PageProcessing ──▶ Finalizing ──▶ Done
//!    │             │                                  │
//!    └─────────────┴──────────────┬───────────────────┘
//!                                 ▼
//!                               Failed ──▶ queue.fail (retry | dead-letter)
//! ```
//!
//! * **Claimed**: reset the record for this attempt, fetch the source bytes.
//! * **Extracting**: page count and text, off the async runtime.
//! * **PageProcessing**: pages `1..=N` through `buffer_unordered(W)`; each
//!   page renders then uploads. Page failures stay on the page.
//! * **Finalizing**: sort, write the artifact, mark the record complete, ack.
//! * **Failed**: record the error, hand the job back to the queue.
//!
//! Every write a job performs is keyed by document and page, so running the
//! same job twice (lease expiry, crash after upload) converges on the same
//! stored state.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::blob::{artifact_key, BlobStore, JSON_CONTENT_TYPE};
use crate::config::WorkerConfig;
use crate::error::{BlobError, PageError, PipelineError, StoreError};
use crate::job::{DocumentId, FailOutcome, Job, JobFailure, WorkerId};
use crate::output::{DocumentArtifact, PageResult};
use crate::pipeline::extract::{ExtractedDocument, PageExtractor, PdfiumExtractor};
use crate::pipeline::fetch::{SourceFetcher, UrlFetcher};
use crate::pipeline::render::{PageRenderer, PdfiumRenderer};
use crate::pipeline::upload::ArtifactUploader;
use crate::progress::{ProgressTracker, EXTRACTED_PROGRESS};
use crate::queue::JobQueue;
use crate::retry::retry_with_backoff;
use crate::store::DocumentStore;

/// Stage of a job inside one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStage {
    Claimed,
    Extracting,
    PageProcessing,
    Finalizing,
    Done,
    Failed,
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobStage::Claimed => "claimed",
            JobStage::Extracting => "extracting",
            JobStage::PageProcessing => "page_processing",
            JobStage::Finalizing => "finalizing",
            JobStage::Done => "done",
            JobStage::Failed => "failed",
        })
    }
}

/// How a job left the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Finalised and acknowledged.
    Completed {
        page_count: usize,
        failed_pages: usize,
    },
    /// Failed; the queue will offer it again at `retry_at`.
    Retrying { retry_at: chrono::DateTime<Utc> },
    /// Failed permanently or out of attempts.
    DeadLettered { reason: String },
    /// The lease moved to another worker before this one could ack or fail.
    LeaseLost,
    /// The queue could not be told the outcome; the lease will expire and
    /// the job will be redelivered.
    Unreported { reason: String },
}

/// External collaborators a [`Worker`] drives.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn DocumentStore>,
    pub blob: Arc<dyn BlobStore>,
    pub fetcher: Arc<dyn SourceFetcher>,
    pub extractor: Arc<dyn PageExtractor>,
    pub renderer: Arc<dyn PageRenderer>,
}

impl Collaborators {
    /// pdfium-backed extraction and rendering with the URL fetcher.
    pub fn pdfium(
        config: &WorkerConfig,
        store: Arc<dyn DocumentStore>,
        blob: Arc<dyn BlobStore>,
    ) -> Result<Self, PipelineError> {
        Ok(Self {
            store,
            blob,
            fetcher: Arc::new(UrlFetcher::new(config.download_timeout_secs)?),
            extractor: Arc::new(PdfiumExtractor::new(config.password.clone())),
            renderer: Arc::new(PdfiumRenderer::new(
                config.dpi,
                config.max_rendered_pixels,
                config.password.clone(),
            )),
        })
    }
}

/// Runs claimed jobs to a terminal outcome. Cheap to clone.
#[derive(Clone)]
pub struct Worker {
    parts: Collaborators,
    uploader: ArtifactUploader,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(config: WorkerConfig, parts: Collaborators) -> Self {
        let uploader = ArtifactUploader::new(Arc::clone(&parts.blob), config.upload_backoff);
        Self {
            parts,
            uploader,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run `job` and report the outcome to `queue`.
    pub async fn process(&self, queue: &dyn JobQueue, job: Job, worker_id: &WorkerId) -> JobOutcome {
        let span = info_span!(
            "job",
            job_id = %job.id,
            document_id = %job.document_id,
            attempt = job.attempt
        );
        self.process_inner(queue, job, worker_id).instrument(span).await
    }

    async fn process_inner(&self, queue: &dyn JobQueue, job: Job, worker_id: &WorkerId) -> JobOutcome {
        let job_key = job.id.to_string();
        let observer = &self.config.observer;
        observer.on_job_start(&job_key, job.document_id.as_str(), job.attempt);

        match self.execute(&job).await {
            Ok(artifact) => {
                observer.on_job_finished(&job_key, Ok(artifact.succeeded_pages));
                self.acknowledge(queue, &job, worker_id, &artifact).await
            }
            Err((stage, err)) => {
                error!(stage = %stage, kind = err.kind(), "Job failed: {}", err);
                let reason = err.to_string();
                observer.on_job_finished(&job_key, Err(reason.as_str()));
                self.fail_job(queue, &job, worker_id, &err).await
            }
        }
    }

    /// Record the error on the document and report the failure to the queue.
    ///
    /// The record is only written while this worker still owns the job, so a
    /// stale worker cannot overwrite the record of the run that replaced it.
    async fn fail_job(
        &self,
        queue: &dyn JobQueue,
        job: &Job,
        worker_id: &WorkerId,
        err: &PipelineError,
    ) -> JobOutcome {
        let reason = err.to_string();
        let failure = JobFailure::from(err);

        // Renewing the lease proves ownership and keeps rivals out until fail.
        let renewed = retry_with_backoff(
            &self.config.control_backoff,
            "Lease check",
            |e: &PipelineError| matches!(e, PipelineError::QueueUnavailable(_)),
            || queue.heartbeat(job.id, worker_id, self.config.lease_duration),
        )
        .await;

        match renewed {
            Ok(_) => {
                self.record_failure(&job.document_id, &reason).await;
                self.report_failure(queue, job, worker_id, failure).await
            }
            Err(e) => match e.last_error {
                PipelineError::LeaseLost { .. } => {
                    warn!("Lease lost before failure was recorded; leaving document record alone");
                    JobOutcome::LeaseLost
                }
                other => {
                    warn!("Could not confirm lease before recording error: {}", other);
                    let outcome = self.report_failure(queue, job, worker_id, failure).await;
                    // Nobody else can claim a dead job.
                    if matches!(outcome, JobOutcome::DeadLettered { .. }) {
                        self.record_failure(&job.document_id, &reason).await;
                    }
                    outcome
                }
            },
        }
    }

    async fn record_failure(&self, doc: &DocumentId, reason: &str) {
        if let Err(e) = self.parts.store.mark_failed(doc, reason).await {
            warn!("Could not record error on document: {}", e);
        }
    }

    /// Claimed → Extracting → PageProcessing → Finalizing.
    ///
    /// On error, returns the stage that failed alongside the error.
    pub async fn execute(&self, job: &Job) -> Result<DocumentArtifact, (JobStage, PipelineError)> {
        let start = Instant::now();
        let doc = &job.document_id;
        let job_key = job.id.to_string();

        // ── Claimed ──────────────────────────────────────────────────────
        let stage = JobStage::Claimed;
        debug!("Stage → {}", stage);
        self.parts
            .store
            .begin_run(doc)
            .await
            .map_err(|e| (stage, record_write_failed(e)))?;
        let pdf: Arc<Vec<u8>> = Arc::new(
            self.parts
                .fetcher
                .fetch(&job.source_url)
                .await
                .map_err(|e| (stage, PipelineError::from(e)))?,
        );
        info!("Fetched {} bytes from {}", pdf.len(), job.source_url);

        // ── Extracting ───────────────────────────────────────────────────
        let stage = JobStage::Extracting;
        debug!("Stage → {}", stage);
        let extracted = self.extract(Arc::clone(&pdf)).await.map_err(|e| (stage, e))?;
        let total = extracted.page_count();
        info!("Extracted {} pages", total);
        self.config.observer.on_extracted(&job_key, total);
        self.write_progress(&job_key, doc, EXTRACTED_PROGRESS).await;

        // ── PageProcessing ───────────────────────────────────────────────
        let stage = JobStage::PageProcessing;
        debug!("Stage → {} (width {})", stage, self.config.page_concurrency);
        let pages = self.process_pages(&job_key, doc, pdf, extracted).await;

        // ── Finalizing ───────────────────────────────────────────────────
        let stage = JobStage::Finalizing;
        debug!("Stage → {}", stage);
        let artifact = DocumentArtifact::assemble(doc.as_str(), total, pages, Utc::now())
            .map_err(|e| (stage, e))?;
        self.finalize(doc, &artifact).await.map_err(|e| (stage, e))?;

        info!(
            "Job complete: {}/{} pages succeeded in {}ms",
            artifact.succeeded_pages,
            artifact.page_count,
            start.elapsed().as_millis()
        );
        Ok(artifact)
    }

    async fn extract(&self, pdf: Arc<Vec<u8>>) -> Result<ExtractedDocument, PipelineError> {
        let extractor = Arc::clone(&self.parts.extractor);
        let result = tokio::task::spawn_blocking(move || extractor.extract(&pdf))
            .await
            .map_err(|e| PipelineError::ExtractionFailed(format!("extraction task panicked: {e}")))?;
        Ok(result?)
    }

    async fn process_pages(
        &self,
        job_key: &str,
        doc: &DocumentId,
        pdf: Arc<Vec<u8>>,
        extracted: ExtractedDocument,
    ) -> Vec<PageResult> {
        let total = extracted.page_count();
        let extracted = Arc::new(extracted);
        let observer = &self.config.observer;

        let mut completions = stream::iter(1..=total)
            .map(|page_number| {
                let pdf = Arc::clone(&pdf);
                let text = extracted.text(page_number).to_string();
                self.process_page(doc, pdf, page_number, text)
            })
            .buffer_unordered(self.config.page_concurrency);

        // Progress is written here, serially, never from inside a page task.
        let mut tracker = ProgressTracker::new(total);
        let mut results = Vec::with_capacity(total);
        while let Some(result) = completions.next().await {
            match result.error() {
                None => observer.on_page_complete(job_key, result.page_number(), total),
                Some(e) => {
                    observer.on_page_error(job_key, result.page_number(), total, &e.to_string())
                }
            }
            if let Some(progress) = tracker.page_done() {
                self.write_progress(job_key, doc, progress).await;
            }
            results.push(result);
        }
        results
    }

    /// Render then upload one page. Never fails the job.
    async fn process_page(
        &self,
        doc: &DocumentId,
        pdf: Arc<Vec<u8>>,
        page_number: usize,
        text: String,
    ) -> PageResult {
        let renderer = Arc::clone(&self.parts.renderer);
        let rendered = tokio::task::spawn_blocking(move || renderer.render(&pdf, page_number - 1))
            .await
            .map_err(|e| format!("render task panicked: {e}"))
            .and_then(|r| r.map_err(|e| e.to_string()));

        let png = match rendered {
            Ok(png) => png,
            Err(detail) => {
                warn!("Page {}: rendering failed: {}", page_number, detail);
                return PageResult::failed(
                    page_number,
                    text,
                    PageError::RenderFailed {
                        page: page_number,
                        detail,
                    },
                );
            }
        };

        match self.uploader.upload_page(doc.as_str(), page_number, png).await {
            Ok(url) => PageResult::succeeded(page_number, text, url),
            Err(e) => {
                warn!("{}", e);
                PageResult::failed(page_number, text, e)
            }
        }
    }

    /// Progress writes are advisory: a failed write is logged and the job
    /// carries on; the next write or finalisation catches the record up.
    async fn write_progress(&self, job_key: &str, doc: &DocumentId, progress: u8) {
        match self.parts.store.set_progress(doc, progress).await {
            Ok(()) => self.config.observer.on_progress(job_key, progress),
            Err(e) => warn!("Progress write ({}%) failed: {}", progress, e),
        }
    }

    async fn finalize(&self, doc: &DocumentId, artifact: &DocumentArtifact) -> Result<(), PipelineError> {
        let json = artifact.to_json()?;
        let key = artifact_key(doc.as_str());
        let policy = &self.config.control_backoff;

        let url = retry_with_backoff(
            policy,
            "Artifact write",
            |e: &BlobError| !matches!(e, BlobError::InvalidKey(_)),
            || self.parts.blob.put(&key, json.clone(), JSON_CONTENT_TYPE),
        )
        .await
        .map_err(|e| PipelineError::StorageWriteFailed(format!("artifact {key}: {}", e.last_error)))?;

        retry_with_backoff(
            policy,
            "Record completion",
            |e: &StoreError| matches!(e, StoreError::Unavailable(_)),
            || self.parts.store.mark_complete(doc, artifact.page_count, &url),
        )
        .await
        .map_err(|e| record_write_failed(e.last_error))?;

        debug!("Artifact written to {}", url);
        Ok(())
    }

    async fn acknowledge(
        &self,
        queue: &dyn JobQueue,
        job: &Job,
        worker_id: &WorkerId,
        artifact: &DocumentArtifact,
    ) -> JobOutcome {
        let acked = retry_with_backoff(
            &self.config.control_backoff,
            "Ack",
            |e: &PipelineError| matches!(e, PipelineError::QueueUnavailable(_)),
            || queue.ack(job.id, worker_id),
        )
        .await;

        match acked {
            Ok(()) => JobOutcome::Completed {
                page_count: artifact.page_count,
                failed_pages: artifact.failed_pages,
            },
            Err(e) => match e.last_error {
                PipelineError::LeaseLost { .. } => {
                    warn!("Lease lost before ack; another worker owns the job");
                    JobOutcome::LeaseLost
                }
                other => {
                    error!("Ack failed: {}", other);
                    JobOutcome::Unreported {
                        reason: other.to_string(),
                    }
                }
            },
        }
    }

    async fn report_failure(
        &self,
        queue: &dyn JobQueue,
        job: &Job,
        worker_id: &WorkerId,
        failure: JobFailure,
    ) -> JobOutcome {
        let reported = retry_with_backoff(
            &self.config.control_backoff,
            "Fail",
            |e: &PipelineError| matches!(e, PipelineError::QueueUnavailable(_)),
            || queue.fail(job.id, worker_id, &failure),
        )
        .await;

        match reported {
            Ok(FailOutcome::Retrying { retry_at }) => JobOutcome::Retrying { retry_at },
            Ok(FailOutcome::DeadLettered) => JobOutcome::DeadLettered {
                reason: failure.reason,
            },
            Err(e) => match e.last_error {
                PipelineError::LeaseLost { .. } => JobOutcome::LeaseLost,
                other => {
                    error!("Could not report failure to queue: {}", other);
                    JobOutcome::Unreported {
                        reason: other.to_string(),
                    }
                }
            },
        }
    }
}

fn record_write_failed(e: StoreError) -> PipelineError {
    PipelineError::StorageWriteFailed(format!("document record: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_names_are_snake_case() {
        assert_eq!(JobStage::PageProcessing.to_string(), "page_processing");
        assert_eq!(JobStage::Finalizing.to_string(), "finalizing");
    }

    #[test]
    fn record_failures_are_retryable_storage_errors() {
        let e = record_write_failed(StoreError::Unavailable("locked".into()));
        assert!(matches!(e, PipelineError::StorageWriteFailed(_)));
        assert!(e.is_retryable());
    }
}
