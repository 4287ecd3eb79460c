//! Progress arithmetic and the observer trait for pipeline events.
//!
//! Two things live here:
//!
//! * [`page_progress`] and [`ProgressTracker`]: the percentage written to the
//!   document record while pages complete. Extraction accounts for the first
//!   15 %, page work for the next 80 %, and the final 5 % is only reached by
//!   finalisation (`100`).
//! * [`PipelineObserver`]: an in-process callback for hosts that want events
//!   without polling the record store (progress bars, metrics, tests).
//!
//! # Example
//!
//! ```rust
//! use edgequake_pdfpages::{PipelineObserver, WorkerConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingObserver {
//!     pages: AtomicUsize,
//! }
//!
//! impl PipelineObserver for CountingObserver {
//!     fn on_page_complete(&self, _job_id: &str, _page: usize, _total: usize) {
//!         self.pages.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//!
//! let config = WorkerConfig::builder()
//!     .observer(Arc::new(CountingObserver { pages: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Progress written once extraction has finished.
pub const EXTRACTED_PROGRESS: u8 = 15;

/// Ceiling for page-phase progress; only finalisation writes 100.
pub const PAGE_PHASE_CEILING: u8 = 95;

/// Progress after `completed` of `total` pages have finished.
///
/// `min(95, 15 + round(80 × completed / total))`. A zero-page document stays
/// at the extraction mark.
pub fn page_progress(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return EXTRACTED_PROGRESS;
    }
    let completed = completed.min(total) as u64;
    let total = total as u64;
    // Integer round-half-up of 80k/N.
    let share = (80 * completed * 2 + total) / (2 * total);
    (EXTRACTED_PROGRESS as u64 + share).min(PAGE_PHASE_CEILING as u64) as u8
}

/// Serial, monotonic progress counter owned by the job orchestrator.
///
/// Page tasks finish out of order; the orchestrator calls
/// [`ProgressTracker::page_done`] once per completion and writes the returned
/// value only when it is `Some`, i.e. when the percentage actually moved.
#[derive(Debug)]
pub struct ProgressTracker {
    total: usize,
    completed: usize,
    last_written: u8,
}

impl ProgressTracker {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            completed: 0,
            last_written: EXTRACTED_PROGRESS,
        }
    }

    /// Record one finished page; returns the new value if it increased.
    pub fn page_done(&mut self) -> Option<u8> {
        self.completed = (self.completed + 1).min(self.total);
        let next = page_progress(self.completed, self.total);
        if next > self.last_written {
            self.last_written = next;
            Some(next)
        } else {
            None
        }
    }

    pub fn completed(&self) -> usize {
        self.completed
    }
}

/// Called by workers as jobs move through their stages.
///
/// Implementations must be `Send + Sync`: page events arrive from concurrent
/// page tasks and job events from concurrent pool slots. All methods have
/// default no-op implementations so callers only override what they need.
pub trait PipelineObserver: Send + Sync {
    /// A job was claimed and is about to fetch its source.
    fn on_job_start(&self, job_id: &str, document_id: &str, attempt: u32) {
        let _ = (job_id, document_id, attempt);
    }

    /// Extraction finished; `total_pages` page tasks will follow.
    fn on_extracted(&self, job_id: &str, total_pages: usize) {
        let _ = (job_id, total_pages);
    }

    /// A page produced a `succeeded` result.
    fn on_page_complete(&self, job_id: &str, page_num: usize, total_pages: usize) {
        let _ = (job_id, page_num, total_pages);
    }

    /// A page produced a `failed` result.
    fn on_page_error(&self, job_id: &str, page_num: usize, total_pages: usize, error: &str) {
        let _ = (job_id, page_num, total_pages, error);
    }

    /// The record's progress moved to `progress`.
    fn on_progress(&self, job_id: &str, progress: u8) {
        let _ = (job_id, progress);
    }

    /// The job finished: `Ok` with succeeded page count, or the job error text.
    fn on_job_finished(&self, job_id: &str, outcome: Result<usize, &str>) {
        let _ = (job_id, outcome);
    }
}

/// A no-op implementation; the default when no observer is configured.
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

/// Convenience alias matching the type stored in [`crate::config::WorkerConfig`].
pub type Observer = Arc<dyn PipelineObserver>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_formula_matches_reference_points() {
        assert_eq!(page_progress(0, 4), 15);
        assert_eq!(page_progress(1, 4), 35);
        assert_eq!(page_progress(2, 4), 55);
        assert_eq!(page_progress(3, 4), 75);
        // 15 + 80 = 95, the page-phase ceiling.
        assert_eq!(page_progress(4, 4), 95);
    }

    #[test]
    fn progress_rounds_to_nearest() {
        // 80/3 = 26.67 → 27
        assert_eq!(page_progress(1, 3), 42);
        // 160/3 = 53.33 → 53
        assert_eq!(page_progress(2, 3), 68);
    }

    #[test]
    fn zero_pages_stays_at_extraction_mark() {
        assert_eq!(page_progress(0, 0), EXTRACTED_PROGRESS);
    }

    #[test]
    fn tracker_only_reports_increases() {
        // 1000 pages: each page moves 0.08 %, so most completions are silent.
        let mut t = ProgressTracker::new(1000);
        let mut last = EXTRACTED_PROGRESS;
        let mut writes = 0;
        for _ in 0..1000 {
            if let Some(p) = t.page_done() {
                assert!(p > last);
                last = p;
                writes += 1;
            }
        }
        assert_eq!(last, 95);
        assert_eq!(writes, 80);
        assert_eq!(t.completed(), 1000);
    }

    #[test]
    fn tracker_ignores_surplus_completions() {
        let mut t = ProgressTracker::new(1);
        assert_eq!(t.page_done(), Some(95));
        assert_eq!(t.page_done(), None);
    }

    #[test]
    fn noop_observer_does_not_panic() {
        let o: Observer = Arc::new(NoopObserver);
        o.on_job_start("j", "d", 1);
        o.on_extracted("j", 3);
        o.on_page_complete("j", 1, 3);
        o.on_page_error("j", 2, 3, "render failed");
        o.on_progress("j", 42);
        o.on_job_finished("j", Ok(2));
        o.on_job_finished("j", Err("boom"));
    }
}
