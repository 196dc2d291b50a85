use thiserror::Error;

use crate::domain::{TaskId, TaskStatus, TaskType};

/// Errors returned by the processor API and its building blocks.
///
/// Task-body failures are not here: those become data (`TaskFailure`).
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("task {0} is already registered")]
    DuplicateTask(TaskId),

    #[error("work queue is full (capacity={capacity})")]
    QueueFull { capacity: usize },

    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("task {0} is already processing")]
    AlreadyProcessing(TaskId),

    #[error("task {id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task {id} cannot be cancelled in status {status}")]
    NotCancellable { id: TaskId, status: TaskStatus },

    #[error("processor is shutting down")]
    ShuttingDown,

    #[error("duplicate handler for task_type={0}")]
    DuplicateHandler(TaskType),

    #[error("no handlers registered")]
    NoHandlers,

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("worker internal error: {0}")]
    WorkerInternal(String),
}

pub type Result<T, E = ProcessorError> = std::result::Result<T, E>;

/// Error returned by a task handler.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskErrorKind {
    /// Worth retrying.
    Transient,
    /// Retrying will not help.
    Permanent,
}

impl TaskError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: TaskErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: TaskErrorKind::Permanent,
            message: message.into(),
        }
    }
}

impl From<String> for TaskError {
    fn from(message: String) -> Self {
        Self::transient(message)
    }
}

impl From<&str> for TaskError {
    fn from(message: &str) -> Self {
        Self::transient(message)
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(e: serde_json::Error) -> Self {
        Self::permanent(format!("json decode: {e}"))
    }
}
