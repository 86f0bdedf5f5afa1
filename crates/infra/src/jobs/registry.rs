//! Executor registry: job type tag -> executor.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

/// Handler for one job type.
///
/// The payload is handed over verbatim; interpreting it is the executor's
/// business. An `Err` (or a panic) counts as a failed attempt.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    async fn execute(&self, payload: &str) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> Executor for F
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn execute(&self, payload: &str) -> anyhow::Result<()> {
        (self)(payload.to_owned()).await
    }
}

/// Registry error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("executor already registered for job type: {0}")]
    DuplicateJobType(String),
    #[error("no executor registered for job type: {0}")]
    NotFound(String),
}

/// Mapping from job type tag to executor.
///
/// Populated during startup, then handed to the dispatcher which only reads it.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the executor for `job_type`. Each type may be registered once.
    pub fn register<E: Executor>(
        &mut self,
        job_type: impl Into<String>,
        executor: E,
    ) -> Result<&mut Self, RegistryError> {
        let job_type = job_type.into();
        if self.executors.contains_key(&job_type) {
            return Err(RegistryError::DuplicateJobType(job_type));
        }
        self.executors.insert(job_type, Arc::new(executor));
        Ok(self)
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<E: Executor>(
        mut self,
        job_type: impl Into<String>,
        executor: E,
    ) -> Result<Self, RegistryError> {
        self.register(job_type, executor)?;
        Ok(self)
    }

    /// Resolve the executor for a job type.
    pub fn resolve(&self, job_type: &str) -> Result<Arc<dyn Executor>, RegistryError> {
        self.executors
            .get(job_type)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(job_type.to_string()))
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.executors.contains_key(job_type)
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<_> = self.executors.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}
