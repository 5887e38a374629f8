//! Durable background job queue with a retrying worker pool.
//!
//! Producers call [`Queue::enqueue`]; a [`WorkerPool`] claims jobs, hands each
//! to the [`JobProcessor`] registered for its type and reports the outcome
//! back to the queue. Failed jobs are retried with exponential backoff until
//! their attempts run out, then dead-lettered. [`MongoDbQueue`] shares one
//! logical queue between processes; [`MemoryQueue`] keeps everything in
//! process.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use jobqueue_mongodb::prelude::*;
//!
//! struct Transcode;
//!
//! #[async_trait]
//! impl JobProcessor for Transcode {
//!     fn job_types(&self) -> Vec<String> {
//!         vec!["transcode".into()]
//!     }
//!
//!     async fn process_job(&self, job: &Job, _cancellation: CancellationToken) -> anyhow::Result<()> {
//!         println!("transcoding {}", job.id);
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let queue = Arc::new(MongoDbQueue::new("mongodb://localhost:27017/jobs", None).await?);
//! queue.ensure_indexes().await?;
//!
//! let mut registry = ProcessorRegistry::new();
//! registry.register(Transcode)?;
//!
//! let pool = WorkerPool::new(queue, registry, PoolOptions::default());
//! pool.start().await?;
//! pool.enqueue(NewJob::new("transcode", b"video-42".to_vec())).await?;
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod memory;
pub mod pool;
mod queue;
mod types;
mod worker;

pub use crate::core::{
    Job, JobId, JobProcessor, JobStatus, NewJob, ProcessorRegistry, Queue, QueueError,
    QueueOptions, QueueStats, RegistryError, RetryPolicy, Transition,
};
pub use crate::memory::MemoryQueue;
pub use crate::pool::{PoolError, PoolOptions, PoolStats, WorkerPool};
pub use crate::queue::MongoDbQueue;

pub mod prelude {
    pub use async_trait::async_trait;
    pub use tokio_util::sync::CancellationToken;

    pub use crate::core::{
        Job, JobId, JobProcessor, JobStatus, NewJob, ProcessorRegistry, Queue, QueueError,
        QueueOptions, RetryPolicy,
    };
    pub use crate::memory::MemoryQueue;
    pub use crate::pool::{PoolOptions, WorkerPool};
    pub use crate::queue::MongoDbQueue;
}
