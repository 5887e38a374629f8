use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bson::{doc, Document};
use chrono::{DateTime, Utc};
use mongodb::{
    options::{
        ClientOptions, ConnectionString, FindOneAndUpdateOptions, IndexOptions, ReturnDocument,
        Tls, TlsOptions,
    },
    Client, Collection, Database, IndexModel,
};
use tracing::instrument;

use crate::core::job::{add, Job, JobId, JobStatus, NewJob, Transition};
use crate::core::queue::{Queue, QueueError, QueueOptions, QueueStats, LEASE_EXPIRED};
use crate::types::{to_bson, JobRow};

const COLLECTION: &str = "jobqueue_jobs";
const DEFAULT_QUEUE: &str = "default";

/// An implementation of the Queue backed by MongoDB.
///
/// All logical queues live in one collection and are told apart by the
/// `queue` field, so pools for different job classes can share a database.
#[derive(Clone)]
pub struct MongoDbQueue {
    database: Database,
    queue: String,
    options: QueueOptions,
}

impl MongoDbQueue {
    pub async fn new(uri: &str, cert_file: Option<String>) -> Result<Self, mongodb::error::Error> {
        let client = Self::new_client(uri, cert_file).await?;
        let database = client
            .default_database()
            .unwrap_or(client.database("jobqueue"));

        Ok(Self {
            database,
            queue: DEFAULT_QUEUE.to_string(),
            options: QueueOptions::default(),
        })
    }

    async fn new_client(
        uri: &str,
        cert_path: Option<String>,
    ) -> Result<Client, mongodb::error::Error> {
        match cert_path {
            Some(cert_path) => {
                let conn_str = ConnectionString::parse(uri)?;
                let mut options = ClientOptions::parse_connection_string(conn_str).await?;
                options.tls = Some(Tls::Enabled(Self::tls_options(cert_path)));
                let client = Client::with_options(options)?;
                Ok(client)
            }
            None => {
                let client = mongodb::Client::with_uri_str(uri).await?;
                Ok(client)
            }
        }
    }

    fn tls_options(cert_path: String) -> TlsOptions {
        let mut tls_options = TlsOptions::default();
        tls_options.ca_file_path = Some(cert_path.into());
        tls_options.allow_invalid_hostnames = Some(true);
        tls_options
    }

    pub fn with_queue_name(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_options(mut self, options: QueueOptions) -> Self {
        self.options = options;
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    /// Creates the unique `jid` index and the claim index. Safe to call on
    /// every startup.
    pub async fn ensure_indexes(&self) -> Result<(), QueueError> {
        let unique_jid = IndexModel::builder()
            .keys(doc! { "jid": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        let claim = IndexModel::builder()
            .keys(doc! { "queue": 1, "status": 1, "available_at": 1 })
            .build();

        self.collection()
            .create_indexes([unique_jid, claim], None)
            .await
            .context("Failed to create queue indexes")?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn delete_database(&self) -> Result<(), mongodb::error::Error> {
        self.database.drop(None).await
    }

    fn collection(&self) -> Collection<JobRow> {
        self.database.collection(COLLECTION)
    }

    fn by_status(&self, status: JobStatus) -> Document {
        doc! { "queue": &self.queue, "status": status.as_str() }
    }

    async fn try_claim(&self) -> Result<Option<Job>, QueueError> {
        let now = Utc::now();
        let mut filter = self.by_status(JobStatus::Pending);
        filter.insert("available_at", doc! { "$lte": to_bson(now) });

        let update = doc! {
            "$set": {
                "status": JobStatus::Processing.as_str(),
                "updated_at": to_bson(now),
                "lease_expires_at": to_bson(add(now, self.options.visibility_timeout)),
            },
            "$inc": { "attempts": 1 }
        };
        let options = FindOneAndUpdateOptions::builder()
            .sort(doc! { "available_at": 1, "created_at": 1 })
            .return_document(ReturnDocument::After)
            .build();

        let row = self
            .collection()
            .find_one_and_update(filter, update, options)
            .await
            .context("Failed to check out a job from the queue")?;

        Ok(row.map(JobRow::into_job))
    }

    async fn load(&self, id: &JobId) -> Result<Option<Job>, QueueError> {
        let row = self
            .collection()
            .find_one(doc! { "jid": id.as_str() }, None)
            .await
            .context("Failed to load job")?;
        Ok(row.map(JobRow::into_job))
    }

    /// Replaces `before` with `after` only if nobody changed the job in the
    /// meantime. Returns whether the write happened.
    async fn write_back(&self, before: &Job, after: &Job) -> Result<bool, QueueError> {
        let filter = doc! {
            "jid": before.id.as_str(),
            "status": before.status.as_str(),
            "attempts": i64::from(before.attempts),
        };
        let result = self
            .collection()
            .replace_one(filter, JobRow::from_job(after, &self.queue), None)
            .await
            .context("Failed to update job")?;
        Ok(result.matched_count == 1)
    }

    /// Applies `change` to the stored job only while `claim` still owns it.
    async fn transition<F>(&self, claim: &Job, change: F) -> Result<Transition, QueueError>
    where
        F: FnOnce(&mut Job, DateTime<Utc>) -> Result<Transition, QueueError> + Send,
    {
        let before = self
            .load(&claim.id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(claim.id.clone()))?;
        if !before.is_current_claim(claim) {
            tracing::debug!(job_id = %claim.id, attempt = claim.attempts, "claim is no longer current");
            return Ok(Transition::Unchanged);
        }
        self.apply(before, change).await
    }

    async fn apply<F>(&self, before: Job, change: F) -> Result<Transition, QueueError>
    where
        F: FnOnce(&mut Job, DateTime<Utc>) -> Result<Transition, QueueError> + Send,
    {
        let mut after = before.clone();
        let transition = change(&mut after, Utc::now())?;
        if transition == Transition::Unchanged {
            return Ok(transition);
        }
        if !self.write_back(&before, &after).await? {
            tracing::debug!(job_id = %before.id, "job changed concurrently, leaving it alone");
            return Ok(Transition::Unchanged);
        }
        Ok(transition)
    }
}

#[async_trait]
impl Queue for MongoDbQueue {
    #[instrument(skip_all, err, fields(job_type = %job.job_type, payload_size = job.payload.len()))]
    async fn enqueue(&self, job: NewJob) -> Result<JobId, QueueError> {
        let job = job.into_job(self.options.default_max_attempts, Utc::now());

        self.collection()
            .insert_one(JobRow::from_job(&job, &self.queue), None)
            .await
            .context("Failed to add job to the queue")?;

        Ok(job.id)
    }

    #[instrument(skip(self), level = "debug", err)]
    async fn blocking_dequeue(&self, timeout: Duration) -> Result<Option<Job>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(job) = self.try_claim().await? {
                return Ok(Some(job));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep((deadline - now).min(self.options.poll_interval)).await;
        }
    }

    #[instrument(skip(self, claim, result), err, fields(job_id = %claim.id, attempt = claim.attempts))]
    async fn complete_job(&self, claim: &Job, result: Option<String>) -> Result<Transition, QueueError> {
        claim.ensure_claimed()?;
        self.transition(claim, |job, now| job.complete(result, now)).await
    }

    #[instrument(skip(self, claim), err, fields(job_id = %claim.id, attempt = claim.attempts))]
    async fn fail_job(&self, claim: &Job, reason: &str) -> Result<Transition, QueueError> {
        let retry = self.options.retry;
        self.transition(claim, |job, now| Ok(job.fail(reason, &retry, now)))
            .await
    }

    #[instrument(skip(self, claim), err, fields(job_id = %claim.id, attempt = claim.attempts))]
    async fn dead_letter(&self, claim: &Job, reason: &str) -> Result<Transition, QueueError> {
        self.transition(claim, |job, now| Ok(job.dead_letter(reason, now)))
            .await
    }

    #[instrument(skip_all, level = "debug", err, fields(job_id = %claim.id))]
    async fn extend_lease(&self, claim: &Job) -> Result<bool, QueueError> {
        let now = Utc::now();
        let filter = doc! {
            "jid": claim.id.as_str(),
            "status": JobStatus::Processing.as_str(),
            "attempts": i64::from(claim.attempts),
        };
        let update = doc! {
            "$set": {
                "lease_expires_at": to_bson(add(now, self.options.visibility_timeout)),
                "updated_at": to_bson(now),
            }
        };
        let result = self
            .collection()
            .update_one(filter, update, None)
            .await
            .context("Failed to extend job lease")?;
        Ok(result.matched_count == 1)
    }

    fn visibility_timeout(&self) -> Duration {
        self.options.visibility_timeout
    }

    #[instrument(skip_all, err)]
    async fn requeue_expired(&self) -> Result<u64, QueueError> {
        let mut filter = self.by_status(JobStatus::Processing);
        filter.insert("lease_expires_at", doc! { "$lte": to_bson(Utc::now()) });

        let mut cursor = self
            .collection()
            .find(filter, None)
            .await
            .context("Failed to look up expired jobs")?;
        let mut expired = Vec::new();
        while cursor.advance().await.context("Failed to read expired jobs")? {
            let row = cursor
                .deserialize_current()
                .context("Failed to decode expired job")?;
            expired.push(row.into_job());
        }

        let retry = self.options.retry;
        let mut resolved = 0;
        for job in expired {
            let job_id = job.id.clone();
            let transition = self
                .apply(job, |job, now| Ok(job.fail(LEASE_EXPIRED, &retry, now)))
                .await?;
            if transition != Transition::Unchanged {
                tracing::warn!(job_id = %job_id, ?transition, "job lease expired");
                resolved += 1;
            }
        }
        Ok(resolved)
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, QueueError> {
        self.load(id).await
    }

    #[instrument(skip(self), err)]
    async fn cancel_job(&self, id: &JobId) -> Result<(), QueueError> {
        let mut filter = self.by_status(JobStatus::Pending);
        filter.insert("jid", id.as_str());
        let result = self
            .collection()
            .delete_one(filter, None)
            .await
            .context("Failed to remove job from the queue")?;

        if result.deleted_count == 0 {
            Err(QueueError::JobNotFound(id.clone()))
        } else {
            Ok(())
        }
    }

    #[instrument(skip(self), err)]
    async fn purge_finished(&self, older_than: DateTime<Utc>) -> Result<u64, QueueError> {
        let filter = doc! {
            "queue": &self.queue,
            "status": { "$in": [JobStatus::Completed.as_str(), JobStatus::Failed.as_str()] },
            "updated_at": { "$lt": to_bson(older_than) },
        };
        let result = self
            .collection()
            .delete_many(filter, None)
            .await
            .context("Failed to purge finished jobs")?;
        Ok(result.deleted_count)
    }

    #[instrument(skip_all, err)]
    async fn queue_stats(&self) -> Result<QueueStats, QueueError> {
        let mut stats = QueueStats::default();
        for status in JobStatus::ALL {
            let count = self
                .collection()
                .count_documents(self.by_status(status), None)
                .await
                .context("Failed to count jobs")?;
            stats.add(status, count);
        }
        Ok(stats)
    }
}
