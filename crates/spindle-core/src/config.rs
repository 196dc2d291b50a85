//! Processor configuration.
//!
//! Durations are carried as milliseconds so the struct deserializes from
//! plain JSON; accessors hand out [`Duration`]s.
//!
//! ```json
//! { "workers": 8, "retry": { "base_delay_ms": 50 }, "retention_ms": 600000 }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ProcessorError, Result};
use crate::queue::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Number of worker loops.
    pub workers: usize,
    /// Work-queue capacity; `submit` fails with `QueueFull` beyond it.
    pub queue_capacity: usize,
    /// How long an idle worker waits on the queue before re-checking shutdown.
    pub poll_interval_ms: u64,
    /// Retry ceiling for tasks submitted without one.
    pub default_max_retries: u32,
    pub retry: RetryConfig,
    /// Per-attempt time limit for task bodies. `None` = unbounded.
    pub task_timeout_ms: Option<u64>,
    /// Finished tasks older than this are garbage-collected. `None` = keep forever.
    pub retention_ms: Option<u64>,
    pub cleanup_interval_ms: u64,
    /// Replace worker loops that panic.
    pub respawn_workers: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            poll_interval_ms: 100,
            default_max_retries: 3,
            retry: RetryConfig::default(),
            task_timeout_ms: None,
            retention_ms: None,
            cleanup_interval_ms: 60_000,
            respawn_workers: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    /// Fraction of the delay applied as +/- jitter, in `[0, 1]`.
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            backoff_factor: 2.0,
            max_delay_ms: 30_000,
            jitter_ratio: 0.25,
        }
    }
}

impl ProcessorConfig {
    /// Parse and validate a JSON document. Missing fields take defaults.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s)
            .map_err(|e| ProcessorError::InvalidConfig(format!("malformed config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(ProcessorError::InvalidConfig(msg.to_string()));

        if self.workers == 0 {
            return invalid("workers must be at least 1");
        }
        if self.queue_capacity == 0 {
            return invalid("queue_capacity must be at least 1");
        }
        if self.poll_interval_ms == 0 {
            return invalid("poll_interval_ms must be positive");
        }
        if self.cleanup_interval_ms == 0 {
            return invalid("cleanup_interval_ms must be positive");
        }
        if self.task_timeout_ms == Some(0) {
            return invalid("task_timeout_ms must be positive when set");
        }

        self.retry.validate()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_ms.map(Duration::from_millis)
    }

    pub fn retention(&self) -> Option<Duration> {
        self.retention_ms.map(Duration::from_millis)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.policy()
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(ProcessorError::InvalidConfig(msg.to_string()));

        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return invalid("retry.backoff_factor must be a finite number >= 1.0");
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return invalid("retry.jitter_ratio must be within [0, 1]");
        }
        if self.max_delay_ms < self.base_delay_ms {
            return invalid("retry.max_delay_ms must be >= retry.base_delay_ms");
        }
        Ok(())
    }

    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            backoff_factor: self.backoff_factor,
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter_ratio: self.jitter_ratio,
        }
    }
}

/// Settings for [`RateLimitedClient`](crate::client::RateLimitedClient).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Bucket size: how many calls may go out back to back.
    pub burst: u32,
    /// Tokens added per second.
    pub rate_per_sec: f64,
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before probing.
    pub cooldown_ms: u64,
    /// Probe calls allowed while half-open.
    pub half_open_max_calls: u32,
    /// Retries for retryable upstream failures.
    pub max_retries: u32,
    pub retry: RetryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            burst: 10,
            rate_per_sec: 10.0,
            failure_threshold: 5,
            cooldown_ms: 30_000,
            half_open_max_calls: 1,
            max_retries: 3,
            retry: RetryConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(ProcessorError::InvalidConfig(msg.to_string()));

        if self.burst == 0 {
            return invalid("burst must be at least 1");
        }
        if !self.rate_per_sec.is_finite() || self.rate_per_sec <= 0.0 {
            return invalid("rate_per_sec must be a positive number");
        }
        if self.failure_threshold == 0 {
            return invalid("failure_threshold must be at least 1");
        }
        if self.half_open_max_calls == 0 {
            return invalid("half_open_max_calls must be at least 1");
        }
        self.retry.validate()
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}
