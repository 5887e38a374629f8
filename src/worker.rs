use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::job::Job;
use crate::core::processor::{JobProcessor, ProcessorRegistry};
use crate::core::queue::Queue;
use crate::pool::PoolOptions;

/// State shared by every task of one running pool.
pub(crate) struct WorkerContext<Q> {
    pub queue: Arc<Q>,
    pub registry: Arc<ProcessorRegistry>,
    pub options: PoolOptions,
    /// Stops workers from claiming more jobs.
    pub shutdown: CancellationToken,
    /// Fires the cancellation token of every in-flight job.
    pub abandon: CancellationToken,
}

pub(crate) async fn run_worker<Q: Queue>(worker_id: usize, ctx: Arc<WorkerContext<Q>>) {
    debug!(worker_id, "worker started");
    loop {
        if ctx.shutdown.is_cancelled() {
            break;
        }

        let next = tokio::select! {
            biased;
            _ = ctx.shutdown.cancelled() => break,
            next = ctx.queue.blocking_dequeue(ctx.options.dequeue_timeout) => next,
        };

        match next {
            Ok(Some(job)) => process(worker_id, &ctx, job).await,
            Ok(None) => debug!(worker_id, "no job available"),
            Err(err) => {
                error!(worker_id, error = %err, "failed to dequeue job");
                tokio::select! {
                    _ = ctx.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(ctx.options.error_backoff) => {}
                }
            }
        }
    }
    debug!(worker_id, "worker stopped");
}

async fn process<Q: Queue>(worker_id: usize, ctx: &WorkerContext<Q>, job: Job) {
    let Some(processor) = ctx.registry.lookup(&job.job_type) else {
        let reason = format!("no processor registered for job type '{}'", job.job_type);
        error!(worker_id, job_id = %job.id, job_type = %job.job_type, "{reason}");
        if let Err(err) = ctx.queue.dead_letter(&job, &reason).await {
            error!(worker_id, job_id = %job.id, error = %err, "failed to dead-letter job");
        }
        return;
    };

    let limit = processor.timeout().unwrap_or(ctx.options.job_timeout);
    info!(
        worker_id,
        job_id = %job.id,
        job_type = %job.job_type,
        attempt = job.attempts,
        max_attempts = job.max_attempts,
        "processing job"
    );

    let id = job.id.clone();
    let outcome = tokio::select! {
        outcome = run_processor(processor, job.clone(), ctx.abandon.child_token(), limit) => outcome,
        never = keep_lease(worker_id, ctx.queue.as_ref(), &job) => match never {},
    };
    let resolved = match outcome {
        Ok(()) => {
            info!(worker_id, job_id = %id, "job completed");
            ctx.queue.complete_job(&job, None).await
        }
        Err(reason) => {
            warn!(worker_id, job_id = %id, %reason, "job failed");
            ctx.queue.fail_job(&job, &reason).await
        }
    };

    match resolved {
        Ok(transition) => debug!(worker_id, job_id = %id, ?transition, "job resolved"),
        Err(err) => error!(worker_id, job_id = %id, error = %err, "failed to record job outcome"),
    }
}

/// Renews the claim's lease at a third of the visibility timeout for as long
/// as the processor runs. Never returns; the caller drops it.
async fn keep_lease<Q: Queue>(worker_id: usize, queue: &Q, claim: &Job) -> Infallible {
    let visibility = queue.visibility_timeout();
    if visibility.is_zero() {
        return std::future::pending().await;
    }
    let mut ticker = interval(visibility / 3);
    loop {
        ticker.tick().await;
        match queue.extend_lease(claim).await {
            Ok(true) => debug!(worker_id, job_id = %claim.id, "extended job lease"),
            Ok(false) => {
                warn!(worker_id, job_id = %claim.id, "lost job lease, outcome will be ignored");
                return std::future::pending().await;
            }
            Err(err) => warn!(worker_id, job_id = %claim.id, error = %err, "failed to extend job lease"),
        }
    }
}

/// Runs the processor on its own task so a panic only takes down this job.
/// The worker awaits it, so concurrency stays bounded by the worker count.
async fn run_processor(
    processor: Arc<dyn JobProcessor>,
    job: Job,
    cancellation: CancellationToken,
    limit: Duration,
) -> Result<(), String> {
    let token = cancellation.clone();
    let mut task = tokio::spawn(async move { processor.process_job(&job, token).await });

    match tokio::time::timeout(limit, &mut task).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(err))) => Err(format!("{err:#}")),
        Ok(Err(err)) if err.is_panic() => Err("processor panicked".to_string()),
        Ok(Err(_)) => Err("processor was cancelled".to_string()),
        Err(_) => {
            cancellation.cancel();
            task.abort();
            Err(format!("processor timed out after {limit:?}"))
        }
    }
}

/// Logs pool and queue statistics on a fixed interval. Never mutates.
pub(crate) async fn run_monitor<Q: Queue>(ctx: Arc<WorkerContext<Q>>) {
    let mut ticker = interval(ctx.options.monitor_interval);
    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match ctx.queue.queue_stats().await {
            Ok(stats) => info!(
                workers = ctx.options.workers,
                registered_processors = ctx.registry.len(),
                pending = stats.pending,
                processing = stats.processing,
                completed = stats.completed,
                failed = stats.failed,
                total = stats.total,
                "queue stats"
            ),
            Err(err) => warn!(error = %err, "failed to read queue stats"),
        }
    }
}

/// Hands jobs whose lease expired (crashed or abandoned workers) back to the
/// queue's failure handling.
pub(crate) async fn run_reaper<Q: Queue>(ctx: Arc<WorkerContext<Q>>) {
    let mut ticker = interval(ctx.options.reap_interval);
    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match ctx.queue.requeue_expired().await {
            Ok(0) => {}
            Ok(count) => info!(count, "recovered jobs with expired leases"),
            Err(err) => warn!(error = %err, "failed to recover expired jobs"),
        }
    }
}

fn interval(period: Duration) -> tokio::time::Interval {
    let period = period.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}
