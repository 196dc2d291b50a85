//! Retry policy: decides backoff delays.

use std::time::Duration;

use rand::Rng;

/// Retry policy for failed tasks.
///
/// delay = base_delay * backoff_factor^retry_count, capped at max_delay,
/// then jittered by ±jitter_ratio.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Multiplier for exponential backoff.
    pub backoff_factor: f64,

    /// Upper bound for the un-jittered delay.
    pub max_delay: Duration,

    /// Jitter as a fraction of the delay (0.25 = ±25%). 0 disables jitter.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
            jitter_ratio: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay for the given retry count (0-indexed).
    ///
    /// Example with base_delay=100ms, backoff_factor=2.0:
    /// - retry_count 0: 100ms
    /// - retry_count 1: 200ms
    /// - retry_count 2: 400ms
    pub fn base_delay_for(&self, retry_count: u32) -> Duration {
        let exp = retry_count.min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let max_secs = self.max_delay.as_secs_f64();

        // inf / NaN / overflow は全部 max に丸める
        if !secs.is_finite() || secs < 0.0 || secs > max_secs {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Delay for the next retry, with jitter applied.
    pub fn next_delay(&self, retry_count: u32) -> Duration {
        let base = self.base_delay_for(retry_count);
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        if ratio == 0.0 || base.is_zero() {
            return base;
        }

        let factor = rand::thread_rng().gen_range((1.0 - ratio)..=(1.0 + ratio));
        base.mul_f64(factor)
    }
}
