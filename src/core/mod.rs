//! Backend-independent pieces: the job record and its state machine, the
//! queue contract, retry policy and processor dispatch.

pub mod job;
pub mod processor;
pub mod queue;
pub mod retry;

pub use job::{Job, JobId, JobStatus, NewJob, Transition};
pub use processor::{JobProcessor, ProcessorRegistry, RegistryError};
pub use queue::{Queue, QueueError, QueueOptions, QueueStats};
pub use retry::RetryPolicy;
