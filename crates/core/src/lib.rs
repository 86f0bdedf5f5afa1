//! `cadence-core`: primitives of the background job engine.
//!
//! This crate contains **pure** types and decisions (no I/O): job identity,
//! the job record and its status machine, and the retry policy.

pub mod error;
pub mod id;
pub mod job;
pub mod retry;

pub use error::{CoreError, CoreResult};
pub use id::JobId;
pub use job::{JobRecord, JobStatus};
pub use retry::{BackoffStrategy, RetryDecision, RetryPolicy};
