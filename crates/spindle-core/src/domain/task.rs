//! Task record.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::{Payload, TaskId, TaskResult, TaskStatus, TaskType};

/// Completion callback, invoked once with the terminal result.
///
/// Runs on its own tokio task after every internal lock is released, so it
/// may call back into the processor (e.g. submit a follow-up task).
pub type Callback = Arc<dyn Fn(&TaskResult) + Send + Sync>;

/// A unit of work plus its lifecycle metadata.
///
/// The registry owns the authoritative copy; workers only ever see snapshots.
#[derive(Clone)]
pub struct Task {
    pub id: TaskId,
    pub task_type: TaskType,
    pub payload: Payload,

    /// Higher runs sooner; ties are FIFO.
    pub priority: i32,

    /// Number of retries already scheduled.
    pub retry_count: u32,

    /// Number of handler invocations started.
    pub attempts: u32,

    /// Maximum retries. `None` until submission fills in the configured default.
    pub max_retries: Option<u32>,

    pub callback: Option<Callback>,

    pub status: TaskStatus,
    pub last_error: Option<String>,

    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// New task with a generated id, default type and priority 0.
    pub fn new(payload: Payload) -> Self {
        Self {
            id: TaskId::generate(),
            task_type: TaskType::default(),
            payload,
            priority: 0,
            retry_count: 0,
            attempts: 0,
            max_retries: None,
            callback: None,
            status: TaskStatus::Pending,
            last_error: None,
            created_at: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_type(mut self, task_type: impl Into<TaskType>) -> Self {
        self.task_type = task_type.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&TaskResult) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// Effective retry ceiling (0 if never filled in).
    pub fn retry_limit(&self) -> u32 {
        self.max_retries.unwrap_or(0)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("task_type", &self.task_type)
            .field("priority", &self.priority)
            .field("status", &self.status)
            .field("retry_count", &self.retry_count)
            .field("attempts", &self.attempts)
            .field("max_retries", &self.max_retries)
            .field("has_callback", &self.callback.is_some())
            .finish_non_exhaustive()
    }
}
