//! SQLite-backed [`JobQueue`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{add_duration, Clock, JobQueue, SystemClock};
use crate::config::QueueConfig;
use crate::db::{from_ms, to_ms, Database};
use crate::error::{PipelineError, StoreError};
use crate::job::{
    DocumentId, FailOutcome, Job, JobFailure, JobId, JobState, NewJob, QueueStats, WorkerId,
};

const JOB_COLUMNS: &str = "id, document_id, source_url, attempt, lease_owner, lease_expiry_ms, \
                           state, available_at_ms, last_error, created_at_ms, updated_at_ms";

/// Job queue stored in the `jobs` table of a [`Database`].
#[derive(Clone)]
pub struct SqliteJobQueue {
    db: Database,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
}

impl SqliteJobQueue {
    pub fn new(db: Database, config: QueueConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            db,
            config,
            clock: Arc::new(SystemClock),
        })
    }

    /// Replace the time source (tests drive lease expiry and backoff with it).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }
}

// ── Row mapping ──────────────────────────────────────────────────────────

struct JobRow {
    id: String,
    document_id: String,
    source_url: String,
    attempt: i64,
    lease_owner: Option<String>,
    lease_expiry_ms: Option<i64>,
    state: String,
    available_at_ms: i64,
    last_error: Option<String>,
    created_at_ms: i64,
    updated_at_ms: i64,
}

fn read_job_row(row: &rusqlite::Row<'_>) -> Result<JobRow, rusqlite::Error> {
    Ok(JobRow {
        id: row.get(0)?,
        document_id: row.get(1)?,
        source_url: row.get(2)?,
        attempt: row.get(3)?,
        lease_owner: row.get(4)?,
        lease_expiry_ms: row.get(5)?,
        state: row.get(6)?,
        available_at_ms: row.get(7)?,
        last_error: row.get(8)?,
        created_at_ms: row.get(9)?,
        updated_at_ms: row.get(10)?,
    })
}

impl JobRow {
    fn into_job(self) -> Result<Job, StoreError> {
        let corrupt = |what: &str, e: String| {
            StoreError::Unavailable(format!("corrupt job row '{}': {what}: {e}", self.id))
        };
        Ok(Job {
            id: self
                .id
                .parse::<JobId>()
                .map_err(|e| corrupt("id", e.to_string()))?,
            document_id: DocumentId::parse(self.document_id.as_str())
                .map_err(|e| corrupt("document_id", e.to_string()))?,
            source_url: self.source_url.clone(),
            attempt: u32::try_from(self.attempt).map_err(|e| corrupt("attempt", e.to_string()))?,
            lease_owner: self.lease_owner.clone().map(WorkerId::new),
            lease_expiry: self.lease_expiry_ms.map(from_ms).transpose()?,
            state: self
                .state
                .parse::<JobState>()
                .map_err(|e| corrupt("state", e.to_string()))?,
            available_at: from_ms(self.available_at_ms)?,
            last_error: self.last_error.clone(),
            created_at: from_ms(self.created_at_ms)?,
            updated_at: from_ms(self.updated_at_ms)?,
        })
    }
}

fn load_job(conn: &Connection, id: &str) -> Result<Option<Job>, StoreError> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
    conn.query_row(&sql, params![id], read_job_row)
        .optional()?
        .map(JobRow::into_job)
        .transpose()
}

/// Load the job and check `worker` holds its lease.
fn load_owned(conn: &Connection, id: &str, worker: &str) -> Result<Job, StoreError> {
    let job = load_job(conn, id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
    let owned = job.state == JobState::Leased
        && job.lease_owner.as_ref().map(WorkerId::as_str) == Some(worker);
    if !owned {
        return Err(StoreError::LeaseConflict {
            job_id: id.to_string(),
            worker_id: worker.to_string(),
        });
    }
    Ok(job)
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

// ── JobQueue ─────────────────────────────────────────────────────────────

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn enqueue(&self, job: NewJob) -> Result<JobId, PipelineError> {
        let (document_id, source_url) = job.validate()?;
        let id = JobId::new();
        let now = to_ms(self.clock.now());
        let id_text = id.to_string();
        let doc_text = document_id.as_str().to_string();

        self.db
            .call(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO jobs (id, document_id, source_url, attempt, state,
                                      available_at_ms, created_at_ms, updated_at_ms)
                    VALUES (?1, ?2, ?3, 0, 'pending', ?4, ?4, ?4)
                    "#,
                    params![id_text, doc_text, source_url, now],
                )?;
                Ok(())
            })
            .await?;

        info!(job_id = %id, document_id = %document_id, "Job enqueued");
        Ok(id)
    }

    async fn claim(&self, worker: &WorkerId, lease: Duration) -> Result<Option<Job>, PipelineError> {
        let now = self.clock.now();
        let now_ms = to_ms(now);
        let expiry_ms = to_ms(add_duration(now, lease));
        let max_attempts = i64::from(self.config.max_attempts);
        let worker_text = worker.as_str().to_string();

        let (claimed, reaped) = self
            .db
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                // A job whose final attempt lost its lease (worker crash or hang)
                // would otherwise be reclaimed forever. Its document record is
                // failed in the same transaction; a record completed by a later
                // run is left alone.
                tx.execute(
                    r#"
                    INSERT INTO documents (document_id, progress, complete, error, updated_at_ms)
                    SELECT document_id, 0, 0, 'lease expired during final attempt ' || attempt, ?1
                    FROM jobs
                    WHERE state = 'leased' AND lease_expiry_ms <= ?1 AND attempt >= ?2
                    ON CONFLICT(document_id) DO UPDATE
                    SET error = excluded.error, complete = 0, updated_at_ms = excluded.updated_at_ms
                    WHERE documents.complete = 0
                    "#,
                    params![now_ms, max_attempts],
                )?;
                let reaped = tx.execute(
                    r#"
                    UPDATE jobs
                    SET state = 'dead',
                        last_error = 'lease expired during final attempt ' || attempt
                                     || COALESCE(' (last error: ' || last_error || ')', ''),
                        lease_owner = NULL,
                        lease_expiry_ms = NULL,
                        updated_at_ms = ?1
                    WHERE state = 'leased' AND lease_expiry_ms <= ?1 AND attempt >= ?2
                    "#,
                    params![now_ms, max_attempts],
                )?;

                let candidate: Option<String> = tx
                    .query_row(
                        r#"
                        SELECT id FROM jobs
                        WHERE (state = 'pending' AND available_at_ms <= ?1)
                           OR (state = 'leased' AND lease_expiry_ms <= ?1)
                        ORDER BY created_at_ms, rowid
                        LIMIT 1
                        "#,
                        params![now_ms],
                        |row| row.get(0),
                    )
                    .optional()?;

                let Some(id) = candidate else {
                    tx.commit()?;
                    return Ok((None, reaped));
                };

                tx.execute(
                    r#"
                    UPDATE jobs
                    SET state = 'leased',
                        lease_owner = ?2,
                        lease_expiry_ms = ?3,
                        attempt = attempt + 1,
                        updated_at_ms = ?4
                    WHERE id = ?1
                    "#,
                    params![id, worker_text, expiry_ms, now_ms],
                )?;

                let job = load_job(&tx, &id)?;
                tx.commit()?;
                Ok((job, reaped))
            })
            .await?;

        if reaped > 0 {
            warn!(count = reaped, "Dead-lettered jobs whose final lease expired");
        }
        if let Some(job) = &claimed {
            debug!(job_id = %job.id, worker = %worker, attempt = job.attempt, "Job claimed");
        }
        Ok(claimed)
    }

    async fn heartbeat(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        lease: Duration,
    ) -> Result<DateTime<Utc>, PipelineError> {
        let now = self.clock.now();
        let expiry = add_duration(now, lease);
        let (id, owner) = (job_id.to_string(), worker.as_str().to_string());
        let (now_ms, expiry_ms) = (to_ms(now), to_ms(expiry));

        self.db
            .call(move |conn| {
                let changed = conn.execute(
                    r#"
                    UPDATE jobs SET lease_expiry_ms = ?3, updated_at_ms = ?4
                    WHERE id = ?1 AND state = 'leased' AND lease_owner = ?2
                    "#,
                    params![id, owner, expiry_ms, now_ms],
                )?;
                if changed == 0 {
                    return Err(StoreError::LeaseConflict {
                        job_id: id,
                        worker_id: owner,
                    });
                }
                Ok(())
            })
            .await?;
        Ok(expiry)
    }

    async fn ack(&self, job_id: JobId, worker: &WorkerId) -> Result<(), PipelineError> {
        let now_ms = to_ms(self.clock.now());
        let (id, owner) = (job_id.to_string(), worker.as_str().to_string());

        self.db
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                load_owned(&tx, &id, &owner)?;
                tx.execute(
                    r#"
                    UPDATE jobs
                    SET state = 'done', lease_owner = NULL, lease_expiry_ms = NULL,
                        last_error = NULL, updated_at_ms = ?2
                    WHERE id = ?1
                    "#,
                    params![id, now_ms],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?;

        debug!(job_id = %job_id, "Job acknowledged");
        Ok(())
    }

    async fn fail(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        failure: &JobFailure,
    ) -> Result<FailOutcome, PipelineError> {
        let now = self.clock.now();
        let now_ms = to_ms(now);
        let (id, owner) = (job_id.to_string(), worker.as_str().to_string());
        let failure = failure.clone();
        let config = self.config;

        let outcome = self
            .db
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let job = load_owned(&tx, &id, &owner)?;

                let outcome = if failure.retryable && job.attempt < config.max_attempts {
                    // attempt ≥ 1 here: the job was claimed at least once.
                    let delay = config.job_backoff.delay_for(job.attempt.saturating_sub(1));
                    let retry_at = add_duration(now, delay);
                    tx.execute(
                        r#"
                        UPDATE jobs
                        SET state = 'pending', available_at_ms = ?2, lease_owner = NULL,
                            lease_expiry_ms = NULL, last_error = ?3, updated_at_ms = ?4
                        WHERE id = ?1
                        "#,
                        params![id, to_ms(retry_at), failure.reason, now_ms],
                    )?;
                    FailOutcome::Retrying { retry_at }
                } else {
                    tx.execute(
                        r#"
                        UPDATE jobs
                        SET state = 'dead', lease_owner = NULL, lease_expiry_ms = NULL,
                            last_error = ?2, updated_at_ms = ?3
                        WHERE id = ?1
                        "#,
                        params![id, failure.reason, now_ms],
                    )?;
                    FailOutcome::DeadLettered
                };
                tx.commit()?;
                Ok(outcome)
            })
            .await?;

        match outcome {
            FailOutcome::Retrying { retry_at } => {
                info!(job_id = %job_id, retry_at = %retry_at, "Job scheduled for retry")
            }
            FailOutcome::DeadLettered => warn!(job_id = %job_id, "Job dead-lettered"),
        }
        Ok(outcome)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, PipelineError> {
        let id = job_id.to_string();
        Ok(self.db.call(move |conn| load_job(conn, &id)).await?)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<Job>, PipelineError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let jobs = self
            .db
            .call(move |conn| {
                let sql = format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE state = 'dead' \
                     ORDER BY updated_at_ms DESC, rowid DESC LIMIT ?1"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![limit], read_job_row)?;
                let mut jobs = Vec::new();
                for row in rows {
                    jobs.push(row?.into_job()?);
                }
                Ok(jobs)
            })
            .await?;
        Ok(jobs)
    }

    async fn stats(&self) -> Result<QueueStats, PipelineError> {
        let stats = self
            .db
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state")?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?;
                let mut stats = QueueStats::default();
                for row in rows {
                    let (state, count) = row?;
                    let count = u64::try_from(count).unwrap_or(0);
                    match state.as_str() {
                        "pending" => stats.pending = count,
                        "leased" => stats.leased = count,
                        "done" => stats.done = count,
                        "dead" => stats.dead = count,
                        _ => {}
                    }
                }
                Ok(stats)
            })
            .await?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::ManualClock;
    use crate::retry::BackoffPolicy;
    use crate::store::{DocumentStore, SqliteDocumentStore};

    fn queue_at(clock: &ManualClock) -> SqliteJobQueue {
        let db = Database::in_memory().unwrap();
        SqliteJobQueue::new(db, QueueConfig::default())
            .unwrap()
            .with_clock(Arc::new(clock.clone()))
    }

    fn start() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    const LEASE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn enqueue_rejects_invalid_descriptor() {
        let q = queue_at(&ManualClock::new(start()));
        let err = q.enqueue(NewJob::new("", "https://x/a.pdf")).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidJob(_)));
        assert_eq!(q.stats().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn claim_increments_attempt_and_sets_lease() {
        let clock = ManualClock::new(start());
        let q = queue_at(&clock);
        let id = q.enqueue(NewJob::new("doc", "https://x/a.pdf")).await.unwrap();

        let w = WorkerId::new("w1");
        let job = q.claim(&w, LEASE).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.attempt, 1);
        assert_eq!(job.state, JobState::Leased);
        assert_eq!(job.lease_owner, Some(w));
        assert_eq!(job.lease_expiry, Some(start() + chrono::Duration::seconds(60)));
    }

    #[tokio::test]
    async fn claims_oldest_first() {
        let clock = ManualClock::new(start());
        let q = queue_at(&clock);
        let first = q.enqueue(NewJob::new("a", "https://x/a.pdf")).await.unwrap();
        clock.advance(Duration::from_millis(1));
        q.enqueue(NewJob::new("b", "https://x/b.pdf")).await.unwrap();

        let job = q.claim(&WorkerId::new("w"), LEASE).await.unwrap().unwrap();
        assert_eq!(job.id, first);
    }

    #[tokio::test]
    async fn leased_job_is_invisible_until_expiry() {
        let clock = ManualClock::new(start());
        let q = queue_at(&clock);
        q.enqueue(NewJob::new("doc", "https://x/a.pdf")).await.unwrap();

        let a = WorkerId::new("a");
        let b = WorkerId::new("b");
        assert!(q.claim(&a, LEASE).await.unwrap().is_some());
        assert!(q.claim(&b, LEASE).await.unwrap().is_none());

        clock.advance(LEASE);
        let stolen = q.claim(&b, LEASE).await.unwrap().unwrap();
        assert_eq!(stolen.lease_owner, Some(b.clone()));
        assert_eq!(stolen.attempt, 2);

        // The previous owner has lost the lease.
        let err = q.ack(stolen.id, &a).await.unwrap_err();
        assert!(matches!(err, PipelineError::LeaseLost { .. }));
    }

    #[tokio::test]
    async fn heartbeat_extends_lease_for_owner_only() {
        let clock = ManualClock::new(start());
        let q = queue_at(&clock);
        q.enqueue(NewJob::new("doc", "https://x/a.pdf")).await.unwrap();
        let a = WorkerId::new("a");
        let job = q.claim(&a, LEASE).await.unwrap().unwrap();

        clock.advance(Duration::from_secs(50));
        q.heartbeat(job.id, &a, LEASE).await.unwrap();
        clock.advance(Duration::from_secs(50));
        // 100 s after claim, but only 50 s after the heartbeat.
        assert!(q.claim(&WorkerId::new("b"), LEASE).await.unwrap().is_none());

        let err = q
            .heartbeat(job.id, &WorkerId::new("b"), LEASE)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::LeaseLost { .. }));
    }

    #[tokio::test]
    async fn ack_marks_done() {
        let q = queue_at(&ManualClock::new(start()));
        q.enqueue(NewJob::new("doc", "https://x/a.pdf")).await.unwrap();
        let w = WorkerId::new("w");
        let job = q.claim(&w, LEASE).await.unwrap().unwrap();
        q.ack(job.id, &w).await.unwrap();

        let stored = q.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Done);
        assert!(stored.lease_owner.is_none());
        assert!(q.claim(&w, LEASE).await.unwrap().is_none());
        assert_eq!(q.stats().await.unwrap().done, 1);
    }

    #[tokio::test]
    async fn retryable_failures_back_off_then_dead_letter() {
        let clock = ManualClock::new(start());
        let q = queue_at(&clock);
        let id = q.enqueue(NewJob::new("doc", "https://x/404.pdf")).await.unwrap();
        let w = WorkerId::new("w");
        let failure = JobFailure::retryable("fetch failed: HTTP 404");

        let mut delays = Vec::new();
        loop {
            let job = q.claim(&w, LEASE).await.unwrap().unwrap();
            let failed_at = clock.now();
            match q.fail(job.id, &w, &failure).await.unwrap() {
                FailOutcome::Retrying { retry_at } => {
                    delays.push((retry_at - failed_at).num_seconds());
                    // Not claimable one second early.
                    clock.set(retry_at - chrono::Duration::seconds(1));
                    assert!(q.claim(&w, LEASE).await.unwrap().is_none());
                    clock.set(retry_at);
                }
                FailOutcome::DeadLettered => break,
            }
        }
        assert_eq!(delays, vec![5, 10]);

        let dead = q.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, id);
        assert_eq!(dead[0].attempt, 3);
        assert!(dead[0].last_error.as_deref().unwrap().contains("404"));
    }

    #[tokio::test]
    async fn permanent_failure_dead_letters_immediately() {
        let q = queue_at(&ManualClock::new(start()));
        q.enqueue(NewJob::new("doc", "https://x/bad.pdf")).await.unwrap();
        let w = WorkerId::new("w");
        let job = q.claim(&w, LEASE).await.unwrap().unwrap();
        let outcome = q
            .fail(job.id, &w, &JobFailure::permanent("malformed"))
            .await
            .unwrap();
        assert_eq!(outcome, FailOutcome::DeadLettered);
        assert_eq!(q.stats().await.unwrap().dead, 1);
    }

    #[tokio::test]
    async fn expired_final_lease_is_dead_lettered_on_next_claim() {
        let clock = ManualClock::new(start());
        let db = Database::in_memory().unwrap();
        let store = SqliteDocumentStore::new(db.clone());
        let q = SqliteJobQueue::new(db, QueueConfig::default().with_max_attempts(1))
            .unwrap()
            .with_clock(Arc::new(clock.clone()));
        q.enqueue(NewJob::new("doc", "https://x/a.pdf")).await.unwrap();
        let job = q.claim(&WorkerId::new("crashy"), LEASE).await.unwrap().unwrap();
        store.begin_run(&job.document_id).await.unwrap();
        store.set_progress(&job.document_id, 35).await.unwrap();

        clock.advance(LEASE * 2);
        assert!(q.claim(&WorkerId::new("b"), LEASE).await.unwrap().is_none());

        let stored = q.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Dead);
        assert!(stored.last_error.unwrap().contains("lease expired"));

        let record = store.processing_state(&job.document_id).await.unwrap().unwrap();
        assert!(!record.complete);
        assert_eq!(record.progress, 35);
        assert_eq!(
            record.error.as_deref(),
            Some("lease expired during final attempt 1")
        );
    }

    #[tokio::test]
    async fn expired_final_lease_does_not_touch_a_completed_record() {
        let clock = ManualClock::new(start());
        let db = Database::in_memory().unwrap();
        let store = SqliteDocumentStore::new(db.clone());
        let q = SqliteJobQueue::new(db, QueueConfig::default().with_max_attempts(1))
            .unwrap()
            .with_clock(Arc::new(clock.clone()));
        q.enqueue(NewJob::new("doc", "https://x/a.pdf")).await.unwrap();
        let job = q.claim(&WorkerId::new("crashy"), LEASE).await.unwrap().unwrap();
        store
            .mark_complete(&job.document_id, 2, "mem://doc/document.json")
            .await
            .unwrap();

        clock.advance(LEASE * 2);
        assert!(q.claim(&WorkerId::new("b"), LEASE).await.unwrap().is_none());

        let record = store.processing_state(&job.document_id).await.unwrap().unwrap();
        assert!(record.complete);
        assert_eq!(record.error, None);
    }

    #[tokio::test]
    async fn backoff_is_capped_by_policy() {
        let clock = ManualClock::new(start());
        let db = Database::in_memory().unwrap();
        let config = QueueConfig::default().with_max_attempts(10).with_job_backoff(
            BackoffPolicy::new(Duration::from_secs(5), 10).with_max_delay(Duration::from_secs(12)),
        );
        let q = SqliteJobQueue::new(db, config)
            .unwrap()
            .with_clock(Arc::new(clock.clone()));
        q.enqueue(NewJob::new("doc", "https://x/a.pdf")).await.unwrap();
        let w = WorkerId::new("w");

        let mut delays = Vec::new();
        for _ in 0..4 {
            let job = q.claim(&w, LEASE).await.unwrap().unwrap();
            let now = clock.now();
            if let FailOutcome::Retrying { retry_at } =
                q.fail(job.id, &w, &JobFailure::retryable("x")).await.unwrap()
            {
                delays.push((retry_at - now).num_seconds());
                clock.set(retry_at);
            }
        }
        assert_eq!(delays, vec![5, 10, 12, 12]);
    }
}
