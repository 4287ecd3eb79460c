//! Configuration types for the worker pool and the job queue.
//!
//! Worker behaviour is controlled through [`WorkerConfig`], built via its
//! [`WorkerConfigBuilder`]. Queue policy (attempt budget and whole-job
//! backoff) lives in [`QueueConfig`] because it is a property of the queue
//! rather than of any one worker: every process sharing a queue database
//! must agree on it.

use crate::error::PipelineError;
use crate::progress::{NoopObserver, Observer};
use crate::retry::BackoffPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for a [`crate::pool::WorkerPool`] and its workers.
///
/// Built via [`WorkerConfig::builder()`] or using
/// [`WorkerConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_pdfpages::WorkerConfig;
/// use std::time::Duration;
///
/// let config = WorkerConfig::builder()
///     .page_concurrency(4)
///     .job_concurrency(2)
///     .lease_duration(Duration::from_secs(120))
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct WorkerConfig {
    /// Prefix of the worker identity written into leases. Default: `"worker"`.
    ///
    /// Each slot appends `-{pid}-{pool tag}-{slot}` so no two slots, in this
    /// process or another, share an identity.
    pub worker_name: String,

    /// Maximum page tasks in flight for one job. Default: 2.
    pub page_concurrency: usize,

    /// Maximum jobs processed at once by one pool. Default: 2.
    pub job_concurrency: usize,

    /// Lease granted on claim and renewed by each heartbeat. Default: 300 s.
    pub lease_duration: Duration,

    /// Heartbeat period. Must be shorter than `lease_duration`. Default: 60 s.
    pub heartbeat_interval: Duration,

    /// Sleep between claim attempts when the queue is empty. Default: 1 s.
    pub poll_interval: Duration,

    /// Rendering DPI. Range: 72–400. Default: 150.
    pub dpi: u32,

    /// Maximum rendered image dimension in pixels. Default: 2000.
    pub max_rendered_pixels: u32,

    /// Retry policy for a single page upload. Default: 500 ms base, 3 retries.
    pub upload_backoff: BackoffPolicy,

    /// Retry policy for control-plane calls (claim, ack, record writes).
    /// Default: 200 ms base, 5 retries.
    pub control_backoff: BackoffPolicy,

    /// Download timeout for HTTP sources in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Receiver of per-job and per-page events.
    pub observer: Observer,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_name: "worker".to_string(),
            page_concurrency: 2,
            job_concurrency: 2,
            lease_duration: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            dpi: 150,
            max_rendered_pixels: 2000,
            upload_backoff: BackoffPolicy::default(),
            control_backoff: BackoffPolicy::new(Duration::from_millis(200), 5)
                .with_max_delay(Duration::from_secs(10)),
            download_timeout_secs: 120,
            password: None,
            observer: Arc::new(NoopObserver),
        }
    }
}

impl fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("worker_name", &self.worker_name)
            .field("page_concurrency", &self.page_concurrency)
            .field("job_concurrency", &self.job_concurrency)
            .field("lease_duration", &self.lease_duration)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("poll_interval", &self.poll_interval)
            .field("dpi", &self.dpi)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("upload_backoff", &self.upload_backoff)
            .field("control_backoff", &self.control_backoff)
            .field("download_timeout_secs", &self.download_timeout_secs)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("observer", &"<dyn PipelineObserver>")
            .finish()
    }
}

impl WorkerConfig {
    /// Create a new builder for `WorkerConfig`.
    pub fn builder() -> WorkerConfigBuilder {
        WorkerConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`WorkerConfig`].
#[derive(Debug)]
pub struct WorkerConfigBuilder {
    config: WorkerConfig,
}

impl WorkerConfigBuilder {
    pub fn worker_name(mut self, name: impl Into<String>) -> Self {
        self.config.worker_name = name.into();
        self
    }

    pub fn page_concurrency(mut self, n: usize) -> Self {
        self.config.page_concurrency = n;
        self
    }

    pub fn job_concurrency(mut self, n: usize) -> Self {
        self.config.job_concurrency = n;
        self
    }

    pub fn lease_duration(mut self, d: Duration) -> Self {
        self.config.lease_duration = d;
        self
    }

    pub fn heartbeat_interval(mut self, d: Duration) -> Self {
        self.config.heartbeat_interval = d;
        self
    }

    pub fn poll_interval(mut self, d: Duration) -> Self {
        self.config.poll_interval = d;
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 400);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn upload_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.config.upload_backoff = policy;
        self
    }

    pub fn control_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.config.control_backoff = policy;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn observer(mut self, observer: Observer) -> Self {
        self.config.observer = observer;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<WorkerConfig, PipelineError> {
        let c = &self.config;
        if c.page_concurrency == 0 {
            return Err(PipelineError::InvalidConfig(
                "page concurrency must be ≥ 1".into(),
            ));
        }
        if c.job_concurrency == 0 {
            return Err(PipelineError::InvalidConfig(
                "job concurrency must be ≥ 1".into(),
            ));
        }
        if c.lease_duration.is_zero() {
            return Err(PipelineError::InvalidConfig(
                "lease duration must be positive".into(),
            ));
        }
        if c.heartbeat_interval.is_zero() || c.heartbeat_interval >= c.lease_duration {
            return Err(PipelineError::InvalidConfig(format!(
                "heartbeat interval ({:?}) must be positive and shorter than the lease ({:?})",
                c.heartbeat_interval, c.lease_duration
            )));
        }
        if c.worker_name.trim().is_empty() {
            return Err(PipelineError::InvalidConfig(
                "worker name must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Queue policy ─────────────────────────────────────────────────────────

/// Attempt budget and whole-job backoff for a [`crate::queue::JobQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Claims a job may receive before a failure dead-letters it. Default: 3.
    pub max_attempts: u32,

    /// Delay before retry `n` (0-based) is `base × 2^n`, capped. Default: 5 s base.
    #[serde(with = "backoff_serde")]
    pub job_backoff: BackoffPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            job_backoff: BackoffPolicy::new(Duration::from_secs(5), 2)
                .with_max_delay(Duration::from_secs(15 * 60)),
        }
    }
}

impl QueueConfig {
    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn with_job_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.job_backoff = policy;
        self
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.max_attempts == 0 {
            return Err(PipelineError::InvalidConfig(
                "max attempts must be ≥ 1".into(),
            ));
        }
        Ok(())
    }
}

/// Serialises a [`BackoffPolicy`] as milliseconds so queue policy can be
/// logged and compared as plain JSON.
mod backoff_serde {
    use super::BackoffPolicy;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    #[derive(Serialize, Deserialize)]
    struct Repr {
        base_delay_ms: u64,
        multiplier: u32,
        max_delay_ms: u64,
        max_retries: u32,
    }

    pub fn serialize<S: Serializer>(p: &BackoffPolicy, s: S) -> Result<S::Ok, S::Error> {
        Repr {
            base_delay_ms: p.base_delay.as_millis() as u64,
            multiplier: p.multiplier,
            max_delay_ms: p.max_delay.as_millis() as u64,
            max_retries: p.max_retries,
        }
        .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<BackoffPolicy, D::Error> {
        let r = Repr::deserialize(d)?;
        Ok(BackoffPolicy {
            base_delay: Duration::from_millis(r.base_delay_ms),
            multiplier: r.multiplier.max(1),
            max_delay: Duration::from_millis(r.max_delay_ms),
            max_retries: r.max_retries,
        })
    }
}
