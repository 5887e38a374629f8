use bson::spec::BinarySubtype;
use bson::{Binary, DateTime};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::core::job::{Job, JobId, JobStatus};

/// Document shape of a job in the `jobqueue_jobs` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct JobRow {
    pub jid: String,
    pub queue: String,
    pub job_type: String,
    pub payload: Binary,
    pub status: JobStatus,
    pub attempts: i64,
    pub max_attempts: i64,
    pub last_error: Option<String>,
    pub result: Option<String>,
    pub created_at: DateTime,
    pub updated_at: DateTime,
    pub available_at: DateTime,
    pub lease_expires_at: Option<DateTime>,
}

impl JobRow {
    pub fn from_job(job: &Job, queue: &str) -> Self {
        Self {
            jid: job.id.to_string(),
            queue: queue.to_string(),
            job_type: job.job_type.clone(),
            payload: Binary {
                subtype: BinarySubtype::Generic,
                bytes: job.payload.clone(),
            },
            status: job.status,
            attempts: i64::from(job.attempts),
            max_attempts: i64::from(job.max_attempts),
            last_error: job.last_error.clone(),
            result: job.result.clone(),
            created_at: to_bson(job.created_at),
            updated_at: to_bson(job.updated_at),
            available_at: to_bson(job.available_at),
            lease_expires_at: job.lease_expires_at.map(to_bson),
        }
    }

    pub fn into_job(self) -> Job {
        Job {
            id: JobId::from(self.jid),
            job_type: self.job_type,
            payload: self.payload.bytes,
            status: self.status,
            attempts: u32::try_from(self.attempts).unwrap_or_default(),
            max_attempts: u32::try_from(self.max_attempts).unwrap_or(1),
            last_error: self.last_error,
            result: self.result,
            created_at: to_chrono(self.created_at),
            updated_at: to_chrono(self.updated_at),
            available_at: to_chrono(self.available_at),
            lease_expires_at: self.lease_expires_at.map(to_chrono),
        }
    }
}

pub(crate) fn to_bson(value: chrono::DateTime<Utc>) -> DateTime {
    DateTime::from_millis(value.timestamp_millis())
}

pub(crate) fn to_chrono(value: DateTime) -> chrono::DateTime<Utc> {
    value.to_system_time().into()
}
