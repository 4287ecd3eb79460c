//! Worker pool: `job_concurrency` slots, each claiming and running one job
//! at a time.
//!
//! Two bounds compose: at most `job_concurrency` jobs per pool, and at most
//! `page_concurrency` page tasks per job.
//!
//! While a job runs, its slot renews the lease every `heartbeat_interval`.
//! If a heartbeat reports the lease lost, the slot abandons the job (another
//! worker owns it now) and goes back to claiming.
//!
//! Shutdown is cooperative: [`PoolHandle::shutdown`] stops slots from
//! claiming; jobs already running finish (Done or Failed) before
//! [`WorkerPool::run`] returns.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::job::{Job, WorkerId};
use crate::queue::JobQueue;
use crate::retry::retry_with_backoff;
use crate::worker::{JobOutcome, Worker};

/// Counts of job outcomes over a pool's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSummary {
    pub completed: u64,
    pub retrying: u64,
    pub dead_lettered: u64,
    pub lease_lost: u64,
    pub unreported: u64,
}

impl PoolSummary {
    pub fn jobs_run(&self) -> u64 {
        self.completed + self.retrying + self.dead_lettered + self.lease_lost + self.unreported
    }
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    retrying: AtomicU64,
    dead_lettered: AtomicU64,
    lease_lost: AtomicU64,
    unreported: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: &JobOutcome) {
        let counter = match outcome {
            JobOutcome::Completed { .. } => &self.completed,
            JobOutcome::Retrying { .. } => &self.retrying,
            JobOutcome::DeadLettered { .. } => &self.dead_lettered,
            JobOutcome::LeaseLost => &self.lease_lost,
            JobOutcome::Unreported { .. } => &self.unreported,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PoolSummary {
        PoolSummary {
            completed: self.completed.load(Ordering::Relaxed),
            retrying: self.retrying.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            lease_lost: self.lease_lost.load(Ordering::Relaxed),
            unreported: self.unreported.load(Ordering::Relaxed),
        }
    }
}

/// Stops a running pool from claiming new jobs.
#[derive(Clone)]
pub struct PoolHandle {
    shutdown: Arc<watch::Sender<bool>>,
}

impl PoolHandle {
    pub fn shutdown(&self) {
        // Receivers only disappear once the pool has already stopped.
        let _ = self.shutdown.send(true);
    }
}

/// A set of worker slots sharing one queue.
pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    worker: Worker,
    shutdown: Arc<watch::Sender<bool>>,
    pool_tag: String,
}

impl WorkerPool {
    pub fn new(queue: Arc<dyn JobQueue>, worker: Worker) -> Self {
        let (tx, _rx) = watch::channel(false);
        let pool_tag = format!(
            "{}-{}",
            std::process::id(),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        Self {
            queue,
            worker,
            shutdown: Arc::new(tx),
            pool_tag,
        }
    }

    pub fn handle(&self) -> PoolHandle {
        PoolHandle {
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    /// Run until [`PoolHandle::shutdown`] is called and in-flight jobs finish.
    pub async fn run(self) -> PoolSummary {
        self.run_slots(false).await
    }

    /// Run until the queue has no pending or leased jobs left.
    ///
    /// Jobs waiting out a retry backoff count as pending, so this waits for
    /// them too. Shutdown is honoured as in [`WorkerPool::run`].
    pub async fn run_until_idle(self) -> PoolSummary {
        self.run_slots(true).await
    }

    async fn run_slots(self, exit_when_idle: bool) -> PoolSummary {
        let slots = self.worker.config().job_concurrency;
        let counters = Arc::new(Counters::default());
        info!(slots, pool = %self.pool_tag, "Worker pool starting");

        let mut set = JoinSet::new();
        for slot in 0..slots {
            let worker_id = WorkerId::new(format!(
                "{}-{}-{}",
                self.worker.config().worker_name,
                self.pool_tag,
                slot
            ));
            let ctx = SlotContext {
                worker_id,
                queue: Arc::clone(&self.queue),
                worker: self.worker.clone(),
                shutdown: self.shutdown.subscribe(),
                counters: Arc::clone(&counters),
                exit_when_idle,
            };
            set.spawn(ctx.run());
        }

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!("Worker slot terminated abnormally: {}", e);
            }
        }

        let summary = counters.snapshot();
        info!(
            completed = summary.completed,
            retrying = summary.retrying,
            dead_lettered = summary.dead_lettered,
            "Worker pool stopped"
        );
        summary
    }
}

struct SlotContext {
    worker_id: WorkerId,
    queue: Arc<dyn JobQueue>,
    worker: Worker,
    shutdown: watch::Receiver<bool>,
    counters: Arc<Counters>,
    exit_when_idle: bool,
}

impl SlotContext {
    async fn run(mut self) {
        let config = self.worker.config().clone();
        debug!(worker = %self.worker_id, "Slot started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let claimed = retry_with_backoff(
                &config.control_backoff,
                "Claim",
                |e: &PipelineError| matches!(e, PipelineError::QueueUnavailable(_)),
                || self.queue.claim(&self.worker_id, config.lease_duration),
            )
            .await;

            match claimed {
                Ok(Some(job)) => {
                    let outcome = self.run_job(job).await;
                    self.counters.record(&outcome);
                }
                Ok(None) => {
                    if self.exit_when_idle && self.queue_is_drained().await {
                        break;
                    }
                    self.idle(config.poll_interval).await;
                }
                Err(e) => {
                    error!(worker = %self.worker_id, "Claim failed: {}", e.last_error);
                    self.idle(config.poll_interval).await;
                }
            }
        }
        debug!(worker = %self.worker_id, "Slot stopped");
    }

    async fn queue_is_drained(&self) -> bool {
        match self.queue.stats().await {
            Ok(stats) => stats.active() == 0,
            Err(e) => {
                warn!("Queue stats unavailable: {}", e);
                false
            }
        }
    }

    /// Sleep for `d`, waking early on shutdown.
    async fn idle(&mut self, d: Duration) {
        tokio::select! {
            _ = sleep(d) => {}
            _ = self.shutdown.changed() => {}
        }
    }

    /// Run one job while renewing its lease.
    async fn run_job(&self, job: Job) -> JobOutcome {
        let config = self.worker.config();
        let job_id = job.id;
        let period = config.heartbeat_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let work = self.worker.process(self.queue.as_ref(), job, &self.worker_id);
        tokio::pin!(work);

        loop {
            tokio::select! {
                outcome = &mut work => return outcome,
                _ = ticker.tick() => {
                    match self
                        .queue
                        .heartbeat(job_id, &self.worker_id, config.lease_duration)
                        .await
                    {
                        Ok(expiry) => debug!(job_id = %job_id, "Lease renewed until {}", expiry),
                        Err(PipelineError::LeaseLost { .. }) => {
                            warn!(job_id = %job_id, "Lease lost; abandoning job");
                            return JobOutcome::LeaseLost;
                        }
                        // The next tick tries again; the lease has slack.
                        Err(e) => warn!(job_id = %job_id, "Heartbeat failed: {}", e),
                    }
                }
            }
        }
    }
}
