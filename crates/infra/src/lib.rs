//! Infrastructure layer: job storage, dispatch, retention and configuration.

pub mod config;
pub mod jobs;

pub use config::{ConfigError, EngineConfig};
