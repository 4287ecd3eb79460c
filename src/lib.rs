//! # edgequake-pdfpages
//!
//! Turn uploaded PDFs into per-page text and page images, durably.
//!
//! A document is processed by a job on a lease-based queue. A worker pool
//! claims jobs, extracts every page's text, renders each page to PNG under
//! bounded concurrency, uploads the images with retry/backoff, and writes an
//! aggregate JSON artifact. Progress and terminal state are kept on a
//! document record that clients poll, and survive worker restarts.
//!
//! ## Pipeline Overview
//!
//! ```text
//! enqueue ──▶ queue (SQLite) ──claim──▶ worker slot
//!                                          │
//!                                          ├─ 1. Fetch     source bytes (HTTP / file)
//!                                          ├─ 2. Extract   page count + text (pdfium)
//!                                          ├─ 3. Pages     render ▶ upload, W at a time
//!                                          ├─ 4. Finalize  artifact JSON + record complete
//!                                          └─ 5. Ack       or fail ▶ retry / dead-letter
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_pdfpages::{
//!     Collaborators, Database, JobQueue, LocalBlobStore, NewJob, QueueConfig,
//!     SqliteDocumentStore, SqliteJobQueue, Worker, WorkerConfig, WorkerPool,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::open("pdfpages.db")?;
//!     let queue = Arc::new(SqliteJobQueue::new(db.clone(), QueueConfig::default())?);
//!     queue.enqueue(NewJob::new("doc-1", "https://example.com/paper.pdf")).await?;
//!
//!     let config = WorkerConfig::builder().page_concurrency(4).build()?;
//!     let parts = Collaborators::pdfium(
//!         &config,
//!         Arc::new(SqliteDocumentStore::new(db)),
//!         Arc::new(LocalBlobStore::new("blobs")?),
//!     )?;
//!     let pool = WorkerPool::new(queue, Worker::new(config, parts));
//!     let summary = pool.run_until_idle().await;
//!     eprintln!("{} jobs completed", summary.completed);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdfpages` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-pdfpages = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod blob;
pub mod config;
pub mod db;
pub mod error;
pub mod job;
pub mod output;
pub mod pdfium;
pub mod pipeline;
pub mod pool;
pub mod progress;
pub mod queue;
pub mod retry;
pub mod store;
pub mod worker;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use blob::{BlobStore, LocalBlobStore, MemoryBlobStore};
pub use config::{QueueConfig, WorkerConfig, WorkerConfigBuilder};
pub use db::Database;
pub use error::{PageError, PipelineError};
pub use job::{DocumentId, FailOutcome, Job, JobFailure, JobId, JobState, NewJob, QueueStats, WorkerId};
pub use output::{DocumentArtifact, PageResult, PageStatus};
pub use pool::{PoolHandle, PoolSummary, WorkerPool};
pub use progress::{NoopObserver, PipelineObserver};
pub use queue::{Clock, JobQueue, ManualClock, SqliteJobQueue, SystemClock};
pub use retry::BackoffPolicy;
pub use store::{DocumentStore, ProcessingState, SqliteDocumentStore};
pub use worker::{Collaborators, JobOutcome, JobStage, Worker};
