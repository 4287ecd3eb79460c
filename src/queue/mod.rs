//! Durable, lease-based job queue.
//!
//! ```text
//!  enqueue ──▶ pending ──claim──▶ leased ──ack──▶ done
//!                ▲                  │ │
//!                └──fail(retry)─────┘ └──fail(permanent | out of attempts)──▶ dead
//!                ▲                  │
//!                └──lease expired───┘   (reclaimable by any worker)
//! ```
//!
//! Delivery is at-least-once: a worker that stalls past its lease loses the
//! job to the next claimant, so everything downstream of `claim` must be
//! idempotent.

mod sqlite;

pub use sqlite::SqliteJobQueue;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use crate::error::PipelineError;
use crate::job::{FailOutcome, Job, JobFailure, JobId, NewJob, QueueStats, WorkerId};

/// Storage-agnostic queue interface consumed by the pool and the CLI.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Persist a new job; it is claimable immediately.
    async fn enqueue(&self, job: NewJob) -> Result<JobId, PipelineError>;

    /// Lease the oldest claimable job to `worker`, if any.
    ///
    /// Claimable means pending and past `available_at`, or leased with an
    /// expired lease. The returned job's `attempt` already counts this claim.
    async fn claim(&self, worker: &WorkerId, lease: Duration) -> Result<Option<Job>, PipelineError>;

    /// Extend `worker`'s lease on `job_id` to `now + lease`.
    async fn heartbeat(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        lease: Duration,
    ) -> Result<DateTime<Utc>, PipelineError>;

    /// Mark the job done. Fails with `LeaseLost` unless `worker` holds it.
    async fn ack(&self, job_id: JobId, worker: &WorkerId) -> Result<(), PipelineError>;

    /// Record a failed attempt: schedule a retry or dead-letter the job.
    async fn fail(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        failure: &JobFailure,
    ) -> Result<FailOutcome, PipelineError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, PipelineError>;

    /// Most recently dead-lettered jobs first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<Job>, PipelineError>;

    async fn stats(&self) -> Result<QueueStats, PipelineError>;
}

// ── Clock ────────────────────────────────────────────────────────────────

/// Source of "now" for lease and backoff arithmetic.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Used to test lease expiry and
/// retry schedules without sleeping.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = add_duration(*now, by);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// `start + d`, saturating instead of overflowing.
pub(crate) fn add_duration(start: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| start.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
