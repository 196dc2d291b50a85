//! Decision model: what to do with a task after a failed attempt.
//!
//! This module defines the Decision type (what to do next) and the Decider trait
//! (how to determine the next action based on task state and the failure).

use std::time::Duration;

use super::{Task, TaskFailure};
use crate::queue::RetryPolicy;

/// The next action to take for a failed task.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Put the task back into the queue after a delay.
    Retry { delay: Duration, reason: String },

    /// Give up and publish the failure.
    Fail { reason: String },
}

/// Trait for deciding the next action based on task state and failure.
///
/// Deciders are pure functions: given the current state and observation,
/// they return the next action without side effects. Applying the decision
/// (requeue, publish) is the worker's job.
pub trait Decider: Send + Sync {
    /// # Arguments
    /// * `task` - snapshot of the task (retry_count, max_retries, ...)
    /// * `failure` - the failure of the most recent attempt
    fn decide(&self, task: &Task, failure: &TaskFailure) -> Decision;
}

/// Default decider.
///
/// - Fail immediately on non-retryable kinds (permanent, missing handler).
/// - Retry while `retry_count < max_retries`, delayed by the RetryPolicy.
/// - Fail once the ceiling is reached.
#[derive(Debug, Clone)]
pub struct DefaultDecider {
    retry_policy: RetryPolicy,
}

impl DefaultDecider {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self { retry_policy }
    }
}

impl Default for DefaultDecider {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, task: &Task, failure: &TaskFailure) -> Decision {
        if !failure.kind.is_retryable() {
            return Decision::Fail {
                reason: format!("non-retryable failure ({:?})", failure.kind),
            };
        }

        let limit = task.retry_limit();
        if task.retry_count >= limit {
            Decision::Fail {
                reason: format!("max retries reached: {}/{}", task.retry_count, limit),
            }
        } else {
            let delay = self.retry_policy.next_delay(task.retry_count);
            Decision::Retry {
                delay,
                reason: format!(
                    "retry {}/{} after {:?}",
                    task.retry_count + 1,
                    limit,
                    delay
                ),
            }
        }
    }
}
