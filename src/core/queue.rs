use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::core::job::{Job, JobId, JobStatus, NewJob, Transition};
use crate::core::retry::RetryPolicy;

/// Errors surfaced by queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The backing store could not be reached or rejected the operation.
    #[error(transparent)]
    Unavailable(#[from] anyhow::Error),
    #[error("job {0} not found")]
    JobNotFound(JobId),
    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("failed to encode job payload")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("failed to decode job payload")]
    Decode(#[from] bincode::error::DecodeError),
}

/// Point-in-time job counts. May lag behind concurrent mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
}

impl QueueStats {
    pub fn add(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
        }
        self.total += count;
    }
}

/// Queue-side policy shared by all backends.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Used when a `NewJob` does not set `max_attempts`.
    pub default_max_attempts: u32,
    pub retry: RetryPolicy,
    /// How long a claimed job stays invisible before the reaper may reclaim it.
    /// Keep it above the longest processor timeout.
    pub visibility_timeout: Duration,
    /// How often a blocking dequeue re-checks the store.
    pub poll_interval: Duration,
}

impl QueueOptions {
    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            default_max_attempts: 3,
            retry: RetryPolicy::default(),
            visibility_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Durable, at-least-once job store shared by producers and worker pools.
///
/// Every state change is atomic at this layer: for a given claim exactly one
/// caller observes it.
#[async_trait]
pub trait Queue: Send + Sync + 'static {
    /// Stores a new `pending` job and returns its id.
    async fn enqueue(&self, job: NewJob) -> Result<JobId, QueueError>;

    /// Claims the oldest eligible pending job, waiting up to `timeout`.
    /// `Ok(None)` means the wait timed out.
    async fn blocking_dequeue(&self, timeout: Duration) -> Result<Option<Job>, QueueError>;

    /// Marks the job held by `claim` completed. Completing it again is a no-op.
    ///
    /// Every resolve call takes the claim returned by `blocking_dequeue` and
    /// only acts while that claim is still current; a worker whose lease
    /// expired gets `Transition::Unchanged` instead of touching a newer claim.
    async fn complete_job(&self, claim: &Job, result: Option<String>) -> Result<Transition, QueueError>;

    /// Records a recoverable failure; requeues with backoff or dead-letters
    /// once the job's attempts are used up.
    async fn fail_job(&self, claim: &Job, reason: &str) -> Result<Transition, QueueError>;

    /// Fails a processing job permanently without touching its retry budget.
    async fn dead_letter(&self, claim: &Job, reason: &str) -> Result<Transition, QueueError>;

    /// Pushes the lease of a still-current claim another `visibility_timeout`
    /// into the future. Returns `false` when the claim is no longer current.
    async fn extend_lease(&self, claim: &Job) -> Result<bool, QueueError>;

    /// Lease length granted by `blocking_dequeue` and `extend_lease`.
    fn visibility_timeout(&self) -> Duration;

    /// Applies `fail_job` to every processing job whose lease has expired.
    /// Returns how many jobs were resolved.
    async fn requeue_expired(&self) -> Result<u64, QueueError>;

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, QueueError>;

    /// Removes a job that has not been claimed yet.
    async fn cancel_job(&self, id: &JobId) -> Result<(), QueueError>;

    /// Deletes completed and failed jobs last updated before `older_than`.
    async fn purge_finished(&self, older_than: DateTime<Utc>) -> Result<u64, QueueError>;

    async fn queue_stats(&self) -> Result<QueueStats, QueueError>;
}

pub(crate) const LEASE_EXPIRED: &str = "visibility timeout expired";
