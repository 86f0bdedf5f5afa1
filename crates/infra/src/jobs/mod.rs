//! Background job engine.
//!
//! ## Design
//!
//! - Jobs are durable records in a [`JobStore`]; there is no in-memory queue
//! - Executors are looked up by job type tag in an [`ExecutorRegistry`]
//! - The [`Dispatcher`] claims due jobs with a compare-and-set and runs them on
//!   a bounded worker pool
//! - Failed attempts are retried up to `max_retries` times, then fail terminally
//! - Jobs stuck in `Running` past the staleness timeout are recovered
//! - The [`RetentionSweeper`] purges records older than the retention window
//!
//! ## Components
//!
//! - `JobStore`: persistence (in-memory or Postgres)
//! - `JobProducer`: enqueues work
//! - `Dispatcher`: one scheduling cycle
//! - `JobEngine`: timers, wake signal and shutdown around the dispatcher and sweeper

pub mod dispatcher;
pub mod engine;
pub mod postgres;
pub mod producer;
pub mod registry;
pub mod stats;
pub mod store;
pub mod sweeper;

pub use dispatcher::{CycleReport, DispatchError, Dispatcher, JobOutcome};
pub use engine::{JobEngine, JobEngineHandle};
pub use postgres::PostgresJobStore;
pub use producer::{JobProducer, SubmitError};
pub use registry::{Executor, ExecutorRegistry, RegistryError};
pub use stats::{DispatcherStats, QueueDepth};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use sweeper::{RetentionSweeper, SweepReport};
