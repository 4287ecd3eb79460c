//! Job descriptors and identifiers shared by the queue, the pool and workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::PipelineError;

/// Opaque job identifier (UUID v4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(JobId)
            .map_err(|e| PipelineError::InvalidJob(format!("bad job id '{s}': {e}")))
    }
}

/// Identifier of the uploaded document a job processes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    /// Accepts ASCII letters, digits, `-`, `_` and `.`, except `.` and `..`.
    ///
    /// The id becomes the first segment of every blob key and of the URLs
    /// built from those keys, so it must need no escaping in either.
    pub fn parse(raw: impl Into<String>) -> Result<Self, PipelineError> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PipelineError::InvalidJob("document id is empty".into()));
        }
        if trimmed == "." || trimmed == ".." {
            return Err(PipelineError::InvalidJob(format!(
                "document id '{trimmed}' is a relative path"
            )));
        }
        if let Some(bad) = trimmed
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(PipelineError::InvalidJob(format!(
                "document id '{trimmed}' contains '{bad}'; use letters, digits, '-', '_' or '.'"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity a worker slot writes into the leases it holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting to be claimed (possibly not before `available_at`).
    Pending,
    /// Claimed by a worker until `lease_expiry`.
    Leased,
    /// Acknowledged; no longer in the active set.
    Done,
    /// Failed permanently or out of attempts; kept for inspection.
    Dead,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Leased => "leased",
            JobState::Done => "done",
            JobState::Dead => "dead",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "leased" => Ok(JobState::Leased),
            "done" => Ok(JobState::Done),
            "dead" => Ok(JobState::Dead),
            other => Err(PipelineError::Internal(format!("unknown job state '{other}'"))),
        }
    }
}

/// A job as stored by the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub document_id: DocumentId,
    pub source_url: String,
    /// Number of claims so far; 0 until first claimed.
    pub attempt: u32,
    pub lease_owner: Option<WorkerId>,
    pub lease_expiry: Option<DateTime<Utc>>,
    pub state: JobState,
    /// Earliest time the job may be claimed again.
    pub available_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Descriptor accepted by [`crate::queue::JobQueue::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub document_id: String,
    pub source_url: String,
}

impl NewJob {
    pub fn new(document_id: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            source_url: source_url.into(),
        }
    }

    /// Check the descriptor before it is persisted.
    pub fn validate(&self) -> Result<(DocumentId, String), PipelineError> {
        let document_id = DocumentId::parse(self.document_id.as_str())?;
        let url = self.source_url.trim();
        let supported = ["http://", "https://", "file://"]
            .iter()
            .any(|scheme| {
                url.len() > scheme.len()
                    && url
                        .get(..scheme.len())
                        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(scheme))
            });
        if !supported {
            return Err(PipelineError::InvalidJob(format!(
                "source URL '{url}' must be http(s):// or file://"
            )));
        }
        Ok((document_id, url.to_string()))
    }
}

/// Why a job attempt failed, as handed to [`crate::queue::JobQueue::fail`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub reason: String,
    pub retryable: bool,
}

impl JobFailure {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: true,
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: false,
        }
    }
}

impl From<&PipelineError> for JobFailure {
    fn from(e: &PipelineError) -> Self {
        Self {
            reason: e.to_string(),
            retryable: e.is_retryable(),
        }
    }
}

/// What [`crate::queue::JobQueue::fail`] did with the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back to pending; claimable again at `retry_at`.
    Retrying { retry_at: DateTime<Utc> },
    /// Moved to the dead-letter set.
    DeadLettered,
}

/// Per-state job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub leased: u64,
    pub done: u64,
    pub dead: u64,
}

impl QueueStats {
    /// Jobs not yet in a terminal state.
    pub fn active(&self) -> u64 {
        self.pending + self.leased
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_id_rejects_empty_and_separators() {
        assert!(DocumentId::parse("  ").is_err());
        assert!(DocumentId::parse("a/b").is_err());
        assert!(DocumentId::parse("..").is_err());
        assert_eq!(DocumentId::parse(" doc-1 ").unwrap().as_str(), "doc-1");
    }

    #[test]
    fn document_id_rejects_characters_that_need_url_escaping() {
        for raw in ["my report", "a#b", "50%", "q?x=1", "naïve", "a\\b"] {
            let err = DocumentId::parse(raw).unwrap_err();
            assert!(matches!(err, PipelineError::InvalidJob(_)), "{raw}");
        }
        assert_eq!(
            DocumentId::parse("Report_2024.v2-final").unwrap().as_str(),
            "Report_2024.v2-final"
        );
        assert!(NewJob::new("my report", "https://x/a.pdf").validate().is_err());
    }

    #[test]
    fn new_job_accepts_supported_schemes() {
        for url in ["https://x/doc.pdf", "HTTP://x/doc.pdf", "file:///tmp/doc.pdf"] {
            assert!(NewJob::new("doc", url).validate().is_ok(), "{url}");
        }
    }

    #[test]
    fn new_job_rejects_other_schemes() {
        let err = NewJob::new("doc", "ftp://x/doc.pdf").validate().unwrap_err();
        assert!(matches!(err, PipelineError::InvalidJob(_)));
        assert!(NewJob::new("doc", "https://").validate().is_err());
    }

    #[test]
    fn job_state_parses_its_own_names() {
        for s in [JobState::Pending, JobState::Leased, JobState::Done, JobState::Dead] {
            assert_eq!(s.as_str().parse::<JobState>().unwrap(), s);
        }
    }

    #[test]
    fn failure_from_error_carries_retryability() {
        let f = JobFailure::from(&PipelineError::MalformedDocument("bad".into()));
        assert!(!f.retryable);
        let f = JobFailure::from(&PipelineError::StorageWriteFailed("disk".into()));
        assert!(f.retryable);
    }
}
