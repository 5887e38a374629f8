use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::job::Job;

/// Performs the work for one or more job types.
///
/// The pool never looks inside `Job::payload`; that is between the producer
/// and the processor.
#[async_trait]
pub trait JobProcessor: Send + Sync + 'static {
    /// Job types this processor handles.
    fn job_types(&self) -> Vec<String>;

    /// Per-job timeout for this processor. Falls back to the pool default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Runs one job. `cancellation` fires when the job times out or the pool
    /// abandons it during shutdown; long-running processors should watch it.
    async fn process_job(&self, job: &Job, cancellation: CancellationToken) -> anyhow::Result<()>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("a processor is already registered for job type '{0}'")]
    DuplicateJobType(String),
    #[error("processor declares no job types")]
    NoJobTypes,
}

/// Maps job types to the processor responsible for them.
///
/// Filled before a pool is built; the pool only reads it afterwards.
#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn JobProcessor>>,
    registered: usize,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: JobProcessor>(&mut self, processor: P) -> Result<(), RegistryError> {
        self.register_arc(Arc::new(processor))
    }

    /// Registers every job type the processor declares. Nothing is inserted if
    /// any of them is already taken.
    pub fn register_arc(&mut self, processor: Arc<dyn JobProcessor>) -> Result<(), RegistryError> {
        let job_types = processor.job_types();
        if job_types.is_empty() {
            return Err(RegistryError::NoJobTypes);
        }
        if let Some(taken) = job_types.iter().find(|t| self.processors.contains_key(*t)) {
            return Err(RegistryError::DuplicateJobType(taken.clone()));
        }
        for job_type in job_types {
            tracing::debug!(job_type = %job_type, "registered job processor");
            self.processors.insert(job_type, Arc::clone(&processor));
        }
        self.registered += 1;
        Ok(())
    }

    pub fn lookup(&self, job_type: &str) -> Option<Arc<dyn JobProcessor>> {
        self.processors.get(job_type).cloned()
    }

    /// Number of registered processors (not job types).
    pub fn len(&self) -> usize {
        self.registered
    }

    pub fn is_empty(&self) -> bool {
        self.registered == 0
    }

    pub fn job_types(&self) -> impl Iterator<Item = &str> {
        self.processors.keys().map(String::as_str)
    }
}

impl fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut job_types: Vec<_> = self.job_types().collect();
        job_types.sort_unstable();
        f.debug_struct("ProcessorRegistry")
            .field("job_types", &job_types)
            .field("registered", &self.registered)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Media;

    #[async_trait]
    impl JobProcessor for Media {
        fn job_types(&self) -> Vec<String> {
            vec!["transcode".into(), "thumbnail".into()]
        }

        async fn process_job(&self, _job: &Job, _cancellation: CancellationToken) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Translate(Vec<String>);

    #[async_trait]
    impl JobProcessor for Translate {
        fn job_types(&self) -> Vec<String> {
            self.0.clone()
        }

        async fn process_job(&self, _job: &Job, _cancellation: CancellationToken) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn every_declared_type_resolves_to_the_processor() {
        let mut registry = ProcessorRegistry::new();
        registry.register(Media).unwrap();

        assert!(registry.lookup("transcode").is_some());
        assert!(registry.lookup("thumbnail").is_some());
        assert!(registry.lookup("translate").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn duplicate_job_type_is_rejected_without_partial_insert() {
        let mut registry = ProcessorRegistry::new();
        registry.register(Media).unwrap();

        let err = registry
            .register(Translate(vec!["translate".into(), "thumbnail".into()]))
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateJobType("thumbnail".into()));
        assert!(registry.lookup("translate").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn processor_without_job_types_is_rejected() {
        let mut registry = ProcessorRegistry::new();
        assert_eq!(registry.register(Translate(Vec::new())), Err(RegistryError::NoJobTypes));
        assert!(registry.is_empty());
    }
}
