//! Standalone job worker: runs the engine against Postgres.
//!
//! Subsystems embedding the engine register their own executors; this binary
//! ships only the built-ins below.

pub mod executors;

pub use executors::builtin_registry;
