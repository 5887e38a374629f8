use std::mem;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::job::{JobId, NewJob};
use crate::core::processor::ProcessorRegistry;
use crate::core::queue::{Queue, QueueError, QueueStats};
use crate::worker::{self, WorkerContext};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool is already running")]
    AlreadyRunning,
    #[error("worker pool is not running")]
    NotRunning,
    #[error("worker pool is stopping or stopped")]
    Stopped,
    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Number of concurrent workers. The only bound on job concurrency.
    pub workers: usize,
    /// How long an idle worker blocks on the queue before re-checking for shutdown.
    pub dequeue_timeout: Duration,
    /// Per-job timeout unless the processor declares its own.
    pub job_timeout: Duration,
    pub monitor_interval: Duration,
    /// How often processing jobs are checked for expired leases.
    pub reap_interval: Duration,
    /// Pause after a failed dequeue.
    pub error_backoff: Duration,
    /// How long `stop` waits for in-flight jobs before abandoning them.
    /// `None` waits for them to finish or hit their own timeout.
    pub shutdown_timeout: Option<Duration>,
}

impl PoolOptions {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_timeout = timeout;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            dequeue_timeout: Duration::from_secs(15),
            job_timeout: Duration::from_secs(300),
            monitor_interval: Duration::from_secs(30),
            reap_interval: Duration::from_secs(30),
            error_backoff: Duration::from_secs(1),
            shutdown_timeout: None,
        }
    }
}

/// Snapshot for health and metrics endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub registered_processors: usize,
    pub is_running: bool,
    pub queue: QueueStats,
}

enum Lifecycle {
    Created,
    Running(Running),
    Stopping,
    Stopped,
}

struct Running {
    shutdown: CancellationToken,
    abandon: CancellationToken,
    tasks: JoinSet<()>,
}

/// A fixed set of workers draining one queue.
///
/// Processors are registered up front and frozen for the pool's lifetime.
/// Dropping a running pool aborts its tasks.
pub struct WorkerPool<Q: Queue> {
    queue: Arc<Q>,
    registry: Arc<ProcessorRegistry>,
    options: PoolOptions,
    lifecycle: Mutex<Lifecycle>,
}

impl<Q: Queue> WorkerPool<Q> {
    pub fn new(queue: Arc<Q>, registry: ProcessorRegistry, options: PoolOptions) -> Self {
        Self {
            queue,
            registry: Arc::new(registry),
            options,
            lifecycle: Mutex::new(Lifecycle::Created),
        }
    }

    pub fn queue(&self) -> &Arc<Q> {
        &self.queue
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// Spawns the workers, the monitor and the lease reaper.
    pub async fn start(&self) -> Result<(), PoolError> {
        let mut lifecycle = self.lifecycle.lock().await;
        match *lifecycle {
            Lifecycle::Created => {}
            Lifecycle::Running(_) => return Err(PoolError::AlreadyRunning),
            Lifecycle::Stopping | Lifecycle::Stopped => return Err(PoolError::Stopped),
        }
        if self.registry.is_empty() {
            warn!("starting worker pool without processors; every job will be dead-lettered");
        }

        let shutdown = CancellationToken::new();
        let abandon = CancellationToken::new();
        let ctx = Arc::new(WorkerContext {
            queue: Arc::clone(&self.queue),
            registry: Arc::clone(&self.registry),
            options: self.options.clone(),
            shutdown: shutdown.clone(),
            abandon: abandon.clone(),
        });

        let mut tasks = JoinSet::new();
        for worker_id in 0..self.options.workers {
            tasks.spawn(worker::run_worker(worker_id, Arc::clone(&ctx)));
        }
        tasks.spawn(worker::run_monitor(Arc::clone(&ctx)));
        tasks.spawn(worker::run_reaper(ctx));

        *lifecycle = Lifecycle::Running(Running {
            shutdown,
            abandon,
            tasks,
        });
        info!(
            workers = self.options.workers,
            registered_processors = self.registry.len(),
            "worker pool started"
        );
        Ok(())
    }

    /// Stops claiming new jobs and waits for in-flight ones.
    ///
    /// With a `shutdown_timeout`, jobs still running when it elapses are
    /// abandoned: their cancellation tokens fire and their workers are
    /// aborted. Such jobs stay `processing` until the lease reaper of some
    /// running pool hands them back to the queue.
    pub async fn stop(&self) -> Result<(), PoolError> {
        let running = {
            let mut lifecycle = self.lifecycle.lock().await;
            match mem::replace(&mut *lifecycle, Lifecycle::Stopping) {
                Lifecycle::Running(running) => running,
                Lifecycle::Created => {
                    *lifecycle = Lifecycle::Created;
                    return Err(PoolError::NotRunning);
                }
                other => {
                    *lifecycle = other;
                    return Err(PoolError::Stopped);
                }
            }
        };

        info!("stopping worker pool");
        let Running {
            shutdown,
            abandon,
            mut tasks,
        } = running;
        shutdown.cancel();

        match self.options.shutdown_timeout {
            Some(limit) => {
                if tokio::time::timeout(limit, drain(&mut tasks)).await.is_err() {
                    warn!(?limit, "in-flight jobs did not finish in time, abandoning them");
                    abandon.cancel();
                    tasks.shutdown().await;
                }
            }
            None => drain(&mut tasks).await,
        }

        *self.lifecycle.lock().await = Lifecycle::Stopped;
        info!("worker pool stopped");
        Ok(())
    }

    /// Pass-through to the queue. Works whether or not the pool is running.
    pub async fn enqueue(&self, job: NewJob) -> Result<JobId, QueueError> {
        self.queue.enqueue(job).await
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock().await, Lifecycle::Running(_))
    }

    pub async fn get_stats(&self) -> Result<PoolStats, QueueError> {
        let is_running = self.is_running().await;
        Ok(PoolStats {
            workers: self.options.workers,
            registered_processors: self.registry.len(),
            is_running,
            queue: self.queue.queue_stats().await?,
        })
    }
}

async fn drain(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            if err.is_panic() {
                error!(error = %err, "worker task panicked");
            }
        }
    }
}
