//! Outcome model: the terminal result of a task.
//!
//! A `TaskResult` is created once, when the task reaches a terminal state,
//! and never mutated afterwards.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{TaskId, TaskStatus};

/// Opaque payload carried by tasks and produced by handlers.
pub type Payload = serde_json::Value;

/// Classification of a failed attempt (or of a task that never ran to completion).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// The handler returned a (transient) error.
    Execution,

    /// The handler returned an error marked permanent.
    Permanent,

    /// The handler panicked.
    Panic,

    /// The handler exceeded the per-task timeout.
    Timeout,

    /// No handler is registered for the task type.
    HandlerNotFound,

    /// Cancelled before execution.
    Cancelled,

    /// Still unfinished when the processor shut down.
    Abandoned,
}

impl ErrorKind {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Execution | ErrorKind::Panic | ErrorKind::Timeout
        )
    }
}

/// Failure detail stored in a failed result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: ErrorKind,
    pub message: String,
    /// Retry count at the time the task gave up.
    pub retry_count: u32,
}

impl TaskFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>, retry_count: u32) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_count,
        }
    }
}

/// Either a success payload or a failure detail, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Outcome {
    Success(Payload),
    Failure(TaskFailure),
}

/// Terminal outcome of one task id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub outcome: Outcome,

    /// Number of times the handler was invoked.
    pub attempts: u32,

    /// Wall-clock duration of the final attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,
}

impl TaskResult {
    pub fn success(task_id: TaskId, payload: Payload, attempts: u32) -> Self {
        Self {
            task_id,
            status: TaskStatus::Completed,
            outcome: Outcome::Success(payload),
            attempts,
            duration: None,
        }
    }

    pub fn failure(task_id: TaskId, failure: TaskFailure, attempts: u32) -> Self {
        let status = if failure.kind == ErrorKind::Cancelled {
            TaskStatus::Cancelled
        } else {
            TaskStatus::Failed
        };
        Self {
            task_id,
            status,
            outcome: Outcome::Failure(failure),
            attempts,
            duration: None,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success(_))
    }

    pub fn payload(&self) -> Option<&Payload> {
        match &self.outcome {
            Outcome::Success(p) => Some(p),
            Outcome::Failure(_) => None,
        }
    }

    pub fn failure_detail(&self) -> Option<&TaskFailure> {
        match &self.outcome {
            Outcome::Success(_) => None,
            Outcome::Failure(f) => Some(f),
        }
    }
}
