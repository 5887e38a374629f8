use std::fmt;
use std::time::Duration;

use bincode::{Decode, Encode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::queue::QueueError;
use crate::core::retry::RetryPolicy;

/// Opaque job identifier. Generated as an xid, so ids sort by creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        Self(xid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle state of a job.
///
/// `pending -> processing -> {completed | pending | failed}`. Nothing leaves
/// `completed` or `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a producer hands to `Queue::enqueue`.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: String,
    pub payload: Vec<u8>,
    /// Overrides the queue-wide default when set.
    pub max_attempts: Option<u32>,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            job_type: job_type.into(),
            payload: payload.into(),
            max_attempts: None,
        }
    }

    /// Builds a job whose payload is `payload` encoded with bincode's standard config.
    pub fn encode<T: Encode>(job_type: impl Into<String>, payload: &T) -> Result<Self, QueueError> {
        let bytes = bincode::encode_to_vec(payload, bincode::config::standard())?;
        Ok(Self::new(job_type, bytes))
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Turns the request into a stored `pending` record.
    pub fn into_job(self, default_max_attempts: u32, now: DateTime<Utc>) -> Job {
        Job {
            id: JobId::new(),
            job_type: self.job_type,
            payload: self.payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: self.max_attempts.unwrap_or(default_max_attempts).max(1),
            last_error: None,
            result: None,
            created_at: now,
            updated_at: now,
            available_at: now,
            lease_expires_at: None,
        }
    }
}

/// Result of applying a queue operation to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Completed,
    Requeued { available_at: DateTime<Utc> },
    Failed,
    /// The operation was a no-op (already resolved, or resolved by someone else).
    Unchanged,
}

/// A job as stored by the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub payload: Vec<u8>,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest time a pending job may be claimed. Pushed forward by retry backoff.
    pub available_at: DateTime<Utc>,
    /// Visibility timeout of the current claim.
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Decodes a payload written by [`NewJob::encode`].
    pub fn decode_payload<T: Decode<()>>(&self) -> Result<T, QueueError> {
        let (decoded, _) = bincode::decode_from_slice(&self.payload, bincode::config::standard())?;
        Ok(decoded)
    }

    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.available_at <= now
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Processing
            && self.lease_expires_at.is_some_and(|expires| expires <= now)
    }

    /// Whether `claim` (a copy handed out by a dequeue) still owns this job.
    /// A reaped and reclaimed job has moved on to a higher attempt count.
    pub fn is_current_claim(&self, claim: &Job) -> bool {
        self.status == JobStatus::Processing && self.attempts == claim.attempts
    }

    pub fn claim(&mut self, now: DateTime<Utc>, visibility_timeout: Duration) -> Result<(), QueueError> {
        if self.status != JobStatus::Pending {
            return Err(self.invalid(JobStatus::Processing));
        }
        self.status = JobStatus::Processing;
        self.attempts += 1;
        self.lease_expires_at = Some(add(now, visibility_timeout));
        self.updated_at = now;
        Ok(())
    }

    /// Completing a completed job is a no-op.
    pub fn complete(&mut self, result: Option<String>, now: DateTime<Utc>) -> Result<Transition, QueueError> {
        match self.status {
            JobStatus::Processing => {
                self.status = JobStatus::Completed;
                self.result = result;
                self.last_error = None;
                self.lease_expires_at = None;
                self.updated_at = now;
                Ok(Transition::Completed)
            }
            JobStatus::Completed => Ok(Transition::Unchanged),
            _ => Err(self.invalid(JobStatus::Completed)),
        }
    }

    /// Records `reason` and either requeues with backoff or dead-letters once
    /// `max_attempts` is used up. A job that is not processing is left alone.
    pub fn fail(&mut self, reason: &str, retry: &RetryPolicy, now: DateTime<Utc>) -> Transition {
        if self.status != JobStatus::Processing {
            return Transition::Unchanged;
        }
        if self.attempts >= self.max_attempts {
            return self.dead_letter(reason, now);
        }
        let available_at = add(now, retry.delay_for(self.attempts));
        self.status = JobStatus::Pending;
        self.last_error = Some(reason.to_string());
        self.lease_expires_at = None;
        self.available_at = available_at;
        self.updated_at = now;
        Transition::Requeued { available_at }
    }

    /// Moves a processing job straight to `failed`, whatever its attempts.
    pub fn dead_letter(&mut self, reason: &str, now: DateTime<Utc>) -> Transition {
        if self.status != JobStatus::Processing {
            return Transition::Unchanged;
        }
        self.status = JobStatus::Failed;
        self.last_error = Some(reason.to_string());
        self.lease_expires_at = None;
        self.updated_at = now;
        Transition::Failed
    }

    /// Only a claim handed out by a dequeue can be completed.
    pub(crate) fn ensure_claimed(&self) -> Result<(), QueueError> {
        match self.status {
            JobStatus::Processing => Ok(()),
            _ => Err(self.invalid(JobStatus::Completed)),
        }
    }

    fn invalid(&self, to: JobStatus) -> QueueError {
        QueueError::InvalidTransition {
            id: self.id.clone(),
            from: self.status,
            to,
        }
    }
}

pub(crate) fn add(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
