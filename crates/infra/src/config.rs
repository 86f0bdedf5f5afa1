//! Engine configuration.
//!
//! Values come from `CADENCE_*` environment variables with defaults for
//! anything unset. Durations are given in milliseconds, except the retention
//! window which is given in days.

use std::time::Duration;

use cadence_core::{BackoffStrategy, RetryPolicy};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Dispatcher, retry and retention settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Retries allowed per job after its first attempt
    pub max_retries: u32,
    /// Time between dispatch cycles
    pub dispatch_interval: Duration,
    /// Records older than this are deleted, whatever their status
    pub retention_window: Duration,
    /// Time between retention sweeps
    pub sweep_interval: Duration,
    /// A `Running` job untouched for this long is presumed orphaned
    pub running_staleness_timeout: Duration,
    /// Per-attempt execution limit
    pub execution_timeout: Duration,
    /// Worker pool size
    pub max_concurrent: usize,
    /// Jobs fetched per cycle
    pub batch_size: usize,
    pub backoff: BackoffStrategy,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            dispatch_interval: Duration::from_secs(1),
            retention_window: 30 * DAY,
            sweep_interval: Duration::from_secs(60 * 60),
            running_staleness_timeout: Duration::from_secs(15 * 60),
            execution_timeout: Duration::from_secs(5 * 60),
            max_concurrent: 4,
            batch_size: 100,
            backoff: BackoffStrategy::None,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(5 * 60),
        }
    }
}

impl EngineConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (environment, test fixtures).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            max_retries: parse(&lookup, "CADENCE_MAX_RETRIES")?.unwrap_or(defaults.max_retries),
            dispatch_interval: millis(&lookup, "CADENCE_DISPATCH_INTERVAL_MS")?
                .unwrap_or(defaults.dispatch_interval),
            retention_window: parse::<u32, _>(&lookup, "CADENCE_RETENTION_WINDOW_DAYS")?
                .map(|days| DAY * days)
                .unwrap_or(defaults.retention_window),
            sweep_interval: millis(&lookup, "CADENCE_SWEEP_INTERVAL_MS")?
                .unwrap_or(defaults.sweep_interval),
            running_staleness_timeout: millis(&lookup, "CADENCE_RUNNING_STALENESS_TIMEOUT_MS")?
                .unwrap_or(defaults.running_staleness_timeout),
            execution_timeout: millis(&lookup, "CADENCE_EXECUTION_TIMEOUT_MS")?
                .unwrap_or(defaults.execution_timeout),
            max_concurrent: parse(&lookup, "CADENCE_MAX_CONCURRENT")?
                .unwrap_or(defaults.max_concurrent),
            batch_size: parse(&lookup, "CADENCE_BATCH_SIZE")?.unwrap_or(defaults.batch_size),
            backoff: match lookup("CADENCE_BACKOFF") {
                Some(value) => parse_backoff(&value)?,
                None => defaults.backoff,
            },
            backoff_base: millis(&lookup, "CADENCE_BACKOFF_BASE_MS")?
                .unwrap_or(defaults.backoff_base),
            backoff_max: millis(&lookup, "CADENCE_BACKOFF_MAX_MS")?
                .unwrap_or(defaults.backoff_max),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::Invalid("max_concurrent must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1".into()));
        }
        for (name, value) in [
            ("dispatch_interval", self.dispatch_interval),
            ("sweep_interval", self.sweep_interval),
            ("execution_timeout", self.execution_timeout),
            ("retention_window", self.retention_window),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
            }
        }
        if self.running_staleness_timeout <= self.execution_timeout {
            return Err(ConfigError::Invalid(format!(
                "running_staleness_timeout ({:?}) must exceed execution_timeout ({:?})",
                self.running_staleness_timeout, self.execution_timeout
            )));
        }
        if self.backoff != BackoffStrategy::None && self.backoff_max < self.backoff_base {
            return Err(ConfigError::Invalid(
                "backoff_max must not be smaller than backoff_base".into(),
            ));
        }
        Ok(())
    }

    /// The retry policy shared by failure handling and stale recovery.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            strategy: self.backoff,
            base_delay: self.backoff_base,
            max_delay: self.backoff_max,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_dispatch_interval(mut self, interval: Duration) -> Self {
        self.dispatch_interval = interval;
        self
    }

    pub fn with_retention_window(mut self, window: Duration) -> Self {
        self.retention_window = window;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_running_staleness_timeout(mut self, timeout: Duration) -> Self {
        self.running_staleness_timeout = timeout;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_backoff(mut self, strategy: BackoffStrategy, base: Duration, max: Duration) -> Self {
        self.backoff = strategy;
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }
}

fn parse<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key,
                value,
                reason: e.to_string(),
            }),
    }
}

fn millis<F>(lookup: &F, key: &'static str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(parse::<u64, _>(lookup, key)?.map(Duration::from_millis))
}

fn parse_backoff(value: &str) -> Result<BackoffStrategy, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "none" => Ok(BackoffStrategy::None),
        "fixed" => Ok(BackoffStrategy::Fixed),
        "linear" => Ok(BackoffStrategy::Linear),
        "exponential" => Ok(BackoffStrategy::Exponential),
        _ => Err(ConfigError::InvalidValue {
            key: "CADENCE_BACKOFF",
            value: value.to_string(),
            reason: "expected none, fixed, linear or exponential".into(),
        }),
    }
}
