use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::instrument;

use crate::core::job::{add, Job, JobId, JobStatus, NewJob, Transition};
use crate::core::queue::{Queue, QueueError, QueueOptions, QueueStats, LEASE_EXPIRED};

/// In-process implementation of [`Queue`].
///
/// Not durable: jobs live as long as the value does. Useful for tests and
/// single-process deployments; several pools can still share one instance
/// through an `Arc`.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    jobs: Mutex<Vec<Job>>,
    available: Notify,
    options: QueueOptions,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: QueueOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    /// Applies `apply` to the stored job only while `claim` still owns it.
    async fn transition<F>(&self, claim: &Job, apply: F) -> Result<Transition, QueueError>
    where
        F: FnOnce(&mut Job, DateTime<Utc>) -> Result<Transition, QueueError>,
    {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .iter_mut()
            .find(|job| job.id == claim.id)
            .ok_or_else(|| QueueError::JobNotFound(claim.id.clone()))?;
        if !job.is_current_claim(claim) {
            return Ok(Transition::Unchanged);
        }
        let transition = apply(job, Utc::now())?;
        drop(jobs);

        if matches!(transition, Transition::Requeued { .. }) {
            self.available.notify_waiters();
        }
        Ok(transition)
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    #[instrument(skip_all, err, fields(job_type = %job.job_type, payload_size = job.payload.len()))]
    async fn enqueue(&self, job: NewJob) -> Result<JobId, QueueError> {
        let job = job.into_job(self.options.default_max_attempts, Utc::now());
        let id = job.id.clone();
        self.jobs.lock().await.push(job);
        self.available.notify_waiters();
        Ok(id)
    }

    async fn blocking_dequeue(&self, timeout: Duration) -> Result<Option<Job>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Registered before checking so an enqueue in between still wakes us.
            let notified = self.available.notified();
            {
                let mut jobs = self.jobs.lock().await;
                let now = Utc::now();
                let next = jobs
                    .iter_mut()
                    .filter(|job| job.is_claimable(now))
                    .min_by_key(|job| job.available_at);
                if let Some(job) = next {
                    job.claim(now, self.options.visibility_timeout)?;
                    return Ok(Some(job.clone()));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = (deadline - now).min(self.options.poll_interval);
            let _ = tokio::time::timeout(wait, notified).await;
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
        self.transition(claim, |job, now| Ok(job.fail(reason, &retry, now))).await
    }

    #[instrument(skip(self, claim), err, fields(job_id = %claim.id, attempt = claim.attempts))]
    async fn dead_letter(&self, claim: &Job, reason: &str) -> Result<Transition, QueueError> {
        self.transition(claim, |job, now| Ok(job.dead_letter(reason, now))).await
    }

    async fn extend_lease(&self, claim: &Job) -> Result<bool, QueueError> {
        let mut jobs = self.jobs.lock().await;
        match jobs.iter_mut().find(|job| job.id == claim.id) {
            Some(job) if job.is_current_claim(claim) => {
                job.lease_expires_at = Some(add(Utc::now(), self.options.visibility_timeout));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn visibility_timeout(&self) -> Duration {
        self.options.visibility_timeout
    }

    async fn requeue_expired(&self) -> Result<u64, QueueError> {
        let mut jobs = self.jobs.lock().await;
        let now = Utc::now();
        let mut resolved = 0;
        for job in jobs.iter_mut().filter(|job| job.lease_expired(now)) {
            let transition = job.fail(LEASE_EXPIRED, &self.options.retry, now);
            tracing::warn!(job_id = %job.id, ?transition, "job lease expired");
            resolved += 1;
        }
        drop(jobs);

        if resolved > 0 {
            self.available.notify_waiters();
        }
        Ok(resolved)
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, QueueError> {
        let jobs = self.jobs.lock().await;
        Ok(jobs.iter().find(|job| &job.id == id).cloned())
    }

    async fn cancel_job(&self, id: &JobId) -> Result<(), QueueError> {
        let mut jobs = self.jobs.lock().await;
        match jobs
            .iter()
            .position(|job| &job.id == id && job.status == JobStatus::Pending)
        {
            Some(index) => {
                jobs.remove(index);
                Ok(())
            }
            None => Err(QueueError::JobNotFound(id.clone())),
        }
    }

    async fn purge_finished(&self, older_than: DateTime<Utc>) -> Result<u64, QueueError> {
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|job| !(job.status.is_terminal() && job.updated_at < older_than));
        Ok((before - jobs.len()) as u64)
    }

    async fn queue_stats(&self) -> Result<QueueStats, QueueError> {
        let jobs = self.jobs.lock().await;
        let mut stats = QueueStats::default();
        for job in jobs.iter() {
            stats.add(job.status, 1);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;
    use crate::core::retry::RetryPolicy;

    fn queue() -> MemoryQueue {
        MemoryQueue::with_options(
            QueueOptions::default()
                .with_retry(RetryPolicy::immediate())
                .with_poll_interval(Duration::from_millis(10)),
        )
    }

    #[tokio::test]
    async fn dequeue_times_out_on_empty_queue() {
        let queue = queue();
        let job = queue.blocking_dequeue(Duration::from_millis(30)).await.unwrap();
        assert!(job.is_none());
    }

    #[tokio::test]
    async fn dequeue_is_fifo() {
        let queue = queue();
        let first = queue.enqueue(NewJob::new("noop", b"1".to_vec())).await.unwrap();
        let second = queue.enqueue(NewJob::new("noop", b"2".to_vec())).await.unwrap();

        let a = queue.blocking_dequeue(Duration::ZERO).await.unwrap().unwrap();
        let b = queue.blocking_dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(a.id, first);
        assert_eq!(b.id, second);
        assert_eq!(a.status, JobStatus::Processing);
        assert_eq!(a.attempts, 1);
    }

    #[tokio::test]
    async fn waiting_dequeue_wakes_on_enqueue() {
        let queue = Arc::new(MemoryQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.blocking_dequeue(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let id = queue.enqueue(NewJob::new("noop", Vec::new())).await.unwrap();

        let job = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(job.id, id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_dequeues_never_share_a_job() {
        let queue = Arc::new(queue());
        for i in 0..10u8 {
            queue.enqueue(NewJob::new("noop", vec![i])).await.unwrap();
        }

        let mut claimers = Vec::new();
        for _ in 0..20 {
            let queue = Arc::clone(&queue);
            claimers.push(tokio::spawn(async move {
                queue.blocking_dequeue(Duration::from_millis(50)).await.unwrap()
            }));
        }

        let mut seen = HashSet::new();
        for claimer in claimers {
            if let Some(job) = claimer.await.unwrap() {
                assert!(seen.insert(job.id), "job claimed twice");
            }
        }
        assert_eq!(seen.len(), 10);
    }

    #[tokio::test]
    async fn failed_job_is_retried_then_dead_lettered() {
        let queue = queue();
        let id = queue
            .enqueue(NewJob::new("echo", Vec::new()).with_max_attempts(2))
            .await
            .unwrap();

        let claim = queue.blocking_dequeue(Duration::ZERO).await.unwrap().unwrap();
        let transition = queue.fail_job(&claim, "boom").await.unwrap();
        assert!(matches!(transition, Transition::Requeued { .. }));

        let claim = queue.blocking_dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(queue.fail_job(&claim, "boom").await.unwrap(), Transition::Failed);

        let job = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 2);
        assert!(queue.blocking_dequeue(Duration::ZERO).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn backoff_hides_requeued_job() {
        let queue = MemoryQueue::with_options(
            QueueOptions::default()
                .with_retry(RetryPolicy::exponential(Duration::from_secs(3600), Duration::from_secs(3600)))
                .with_poll_interval(Duration::from_millis(10)),
        );
        queue.enqueue(NewJob::new("echo", Vec::new())).await.unwrap();
        let claim = queue.blocking_dequeue(Duration::ZERO).await.unwrap().unwrap();
        queue.fail_job(&claim, "boom").await.unwrap();

        assert!(queue.blocking_dequeue(Duration::from_millis(30)).await.unwrap().is_none());
        assert_eq!(queue.queue_stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn completing_twice_is_a_noop() {
        let queue = queue();
        queue.enqueue(NewJob::new("noop", Vec::new())).await.unwrap();
        let claim = queue.blocking_dequeue(Duration::ZERO).await.unwrap().unwrap();

        assert_eq!(queue.complete_job(&claim, None).await.unwrap(), Transition::Completed);
        assert_eq!(queue.complete_job(&claim, None).await.unwrap(), Transition::Unchanged);
        let stats = queue.queue_stats().await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.total, 1);
    }

    #[tokio::test]
    async fn completing_a_pending_job_is_rejected() {
        let queue = queue();
        let id = queue.enqueue(NewJob::new("noop", Vec::new())).await.unwrap();
        let pending = queue.get_job(&id).await.unwrap().unwrap();
        let err = queue.complete_job(&pending, None).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { .. }));

        let mut missing = queue.blocking_dequeue(Duration::ZERO).await.unwrap().unwrap();
        missing.id = JobId::from("missing");
        assert!(matches!(
            queue.complete_job(&missing, None).await,
            Err(QueueError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn expired_lease_makes_job_claimable_again() {
        let queue = MemoryQueue::with_options(
            QueueOptions::default()
                .with_retry(RetryPolicy::immediate())
                .with_visibility_timeout(Duration::ZERO),
        );
        let id = queue.enqueue(NewJob::new("noop", Vec::new())).await.unwrap();
        queue.blocking_dequeue(Duration::ZERO).await.unwrap().unwrap();

        assert_eq!(queue.requeue_expired().await.unwrap(), 1);
        let job = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.last_error.as_deref(), Some(LEASE_EXPIRED));

        let again = queue.blocking_dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.attempts, 2);
    }

    #[tokio::test]
    async fn stale_claim_cannot_resolve_a_newer_claim() {
        let queue = MemoryQueue::with_options(
            QueueOptions::default()
                .with_retry(RetryPolicy::immediate())
                .with_visibility_timeout(Duration::ZERO),
        );
        let id = queue.enqueue(NewJob::new("echo", Vec::new())).await.unwrap();
        let first = queue.blocking_dequeue(Duration::ZERO).await.unwrap().unwrap();
        queue.requeue_expired().await.unwrap();
        let second = queue.blocking_dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(second.attempts, 2);

        let stale = queue.fail_job(&first, "stale worker failure").await.unwrap();
        assert_eq!(stale, Transition::Unchanged);
        assert_eq!(queue.complete_job(&first, None).await.unwrap(), Transition::Unchanged);
        assert_eq!(queue.dead_letter(&first, "stale").await.unwrap(), Transition::Unchanged);
        assert!(!queue.extend_lease(&first).await.unwrap());

        let job = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.last_error.as_deref(), Some(LEASE_EXPIRED));

        assert_eq!(queue.complete_job(&second, None).await.unwrap(), Transition::Completed);
        assert_eq!(queue.get_job(&id).await.unwrap().unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn extending_a_lease_keeps_the_job_from_the_reaper() {
        let queue = MemoryQueue::with_options(
            QueueOptions::default()
                .with_retry(RetryPolicy::immediate())
                .with_visibility_timeout(Duration::from_millis(50)),
        );
        let id = queue.enqueue(NewJob::new("transcode", Vec::new())).await.unwrap();
        let claim = queue.blocking_dequeue(Duration::ZERO).await.unwrap().unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(queue.extend_lease(&claim).await.unwrap());
            assert_eq!(queue.requeue_expired().await.unwrap(), 0);
        }
        let job = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.attempts, 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(queue.requeue_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cancel_only_removes_pending_jobs() {
        let queue = queue();
        let pending = queue.enqueue(NewJob::new("noop", Vec::new())).await.unwrap();
        let claimed = queue.enqueue(NewJob::new("noop", Vec::new())).await.unwrap();

        queue.cancel_job(&pending).await.unwrap();
        assert!(queue.get_job(&pending).await.unwrap().is_none());

        let job = queue.blocking_dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(job.id, claimed);
        assert!(matches!(queue.cancel_job(&claimed).await, Err(QueueError::JobNotFound(_))));
    }

    #[tokio::test]
    async fn purge_keeps_unfinished_jobs() {
        let queue = queue();
        queue.enqueue(NewJob::new("noop", Vec::new())).await.unwrap();
        queue.enqueue(NewJob::new("noop", Vec::new())).await.unwrap();
        let done = queue.blocking_dequeue(Duration::ZERO).await.unwrap().unwrap();
        queue.complete_job(&done, None).await.unwrap();

        let purged = queue
            .purge_finished(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        let stats = queue.queue_stats().await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.pending, 1);
    }
}
