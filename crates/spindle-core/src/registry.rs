//! Task registry: the single source of truth for task state.
//!
//! Design:
//! - Every check-then-act (register, claim, retry, finish, cancel) happens
//!   inside one critical section, so two callers can never both observe
//!   "absent" or "pending" and both proceed.
//! - Queue structures hold TaskIds only; all state transitions happen here.
//! - The number of non-terminal tasks is mirrored into a `watch` channel so
//!   shutdown can wait for the system to settle without polling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;

use crate::domain::{Task, TaskId, TaskStatus};
use crate::error::{ProcessorError, Result};
use crate::observability::StatusCounts;
use crate::ports::Clock;

struct RegistryState {
    tasks: HashMap<TaskId, Task>,
    /// Tasks not yet in a terminal state.
    open: usize,
}

pub struct TaskRegistry {
    state: Mutex<RegistryState>,
    open_tx: watch::Sender<usize>,
    clock: Arc<dyn Clock>,
}

impl TaskRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (open_tx, _) = watch::channel(0);
        Self {
            state: Mutex::new(RegistryState {
                tasks: HashMap::new(),
                open: 0,
            }),
            open_tx,
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // 各クリティカルセクションは map を整合した状態で抜けるので poison は無視してよい
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish_open(&self, state: &RegistryState) {
        self.open_tx.send_replace(state.open);
    }

    /// Atomically check absence and insert.
    ///
    /// An id whose record is Pending/Processing is always rejected. A terminal
    /// record is rejected unless `force` is set, in which case it is replaced.
    pub fn register(&self, task: Task, force: bool) -> Result<()> {
        self.register_replacing(task, force, |_| {})
    }

    /// `register`, calling `on_replace` under the registry lock when a forced
    /// submission replaces a terminal record.
    pub fn register_replacing<F>(&self, mut task: Task, force: bool, on_replace: F) -> Result<()>
    where
        F: FnOnce(&TaskId),
    {
        let mut state = self.lock();
        if let Some(existing) = state.tasks.get(&task.id) {
            if !existing.status.is_terminal() || !force {
                return Err(ProcessorError::DuplicateTask(task.id));
            }
            tracing::warn!(task_id = %task.id, previous = %existing.status, "replacing terminal task record");
            on_replace(&task.id);
        }

        task.status = TaskStatus::Pending;
        task.retry_count = 0;
        task.attempts = 0;
        task.last_error = None;
        task.created_at = Some(self.clock.now());
        task.started_at = None;
        task.completed_at = None;

        state.tasks.insert(task.id.clone(), task);
        state.open += 1;
        self.publish_open(&state);
        Ok(())
    }

    /// Undo a `register` whose task never made it onto the queue.
    ///
    /// Only a never-claimed Pending record is removed.
    pub fn discard_pending(&self, id: &TaskId) -> bool {
        let mut state = self.lock();
        let unclaimed = state
            .tasks
            .get(id)
            .is_some_and(|t| t.status == TaskStatus::Pending && t.attempts == 0);
        if !unclaimed {
            return false;
        }
        state.tasks.remove(id);
        state.open -= 1;
        self.publish_open(&state);
        true
    }

    /// Pending -> Processing, atomically with the check.
    ///
    /// Returns a snapshot of the task for execution. This is the sole guard
    /// against two workers executing the same id concurrently.
    pub fn mark_processing(&self, id: &TaskId) -> Result<Task> {
        let mut state = self.lock();
        let task = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| ProcessorError::TaskNotFound(id.clone()))?;

        match task.status {
            TaskStatus::Pending => {
                task.status = TaskStatus::Processing;
                task.attempts += 1;
                task.started_at = Some(self.clock.now());
                Ok(task.clone())
            }
            TaskStatus::Processing => Err(ProcessorError::AlreadyProcessing(id.clone())),
            from => Err(ProcessorError::InvalidTransition {
                id: id.clone(),
                from,
                to: TaskStatus::Processing,
            }),
        }
    }

    /// Processing -> Pending for one retry. Refuses once `retry_count` hits the ceiling.
    pub fn requeue_for_retry(&self, id: &TaskId, error: impl Into<String>) -> Result<Task> {
        let mut state = self.lock();
        let task = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| ProcessorError::TaskNotFound(id.clone()))?;

        if task.status != TaskStatus::Processing || task.retry_count >= task.retry_limit() {
            return Err(ProcessorError::InvalidTransition {
                id: id.clone(),
                from: task.status,
                to: TaskStatus::Pending,
            });
        }

        task.status = TaskStatus::Pending;
        task.retry_count += 1;
        task.last_error = Some(error.into());
        Ok(task.clone())
    }

    /// Move to a terminal status and run `publish` while the registry lock is
    /// still held, so no observer can see the terminal status without its result.
    ///
    /// `publish` must not call back into the registry.
    pub fn finish<F>(
        &self,
        id: &TaskId,
        status: TaskStatus,
        error: Option<String>,
        publish: F,
    ) -> Result<Task>
    where
        F: FnOnce(&Task),
    {
        let mut state = self.lock();
        let task = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| ProcessorError::TaskNotFound(id.clone()))?;

        if !status.is_terminal() || !task.status.can_transition_to(status) {
            return Err(ProcessorError::InvalidTransition {
                id: id.clone(),
                from: task.status,
                to: status,
            });
        }

        task.status = status;
        task.completed_at = Some(self.clock.now());
        if error.is_some() {
            task.last_error = error;
        }
        let snapshot = task.clone();
        publish(&snapshot);

        state.open = state.open.saturating_sub(1);
        self.publish_open(&state);
        Ok(snapshot)
    }

    /// Processing/Pending -> terminal without publishing anything.
    pub fn mark_terminal(&self, id: &TaskId, status: TaskStatus) -> Result<Task> {
        self.finish(id, status, None, |_| {})
    }

    /// Pending -> Cancelled. Fails with `NotCancellable` for any other status.
    pub fn cancel_pending<F>(&self, id: &TaskId, publish: F) -> Result<Task>
    where
        F: FnOnce(&Task),
    {
        {
            let state = self.lock();
            let task = state
                .tasks
                .get(id)
                .ok_or_else(|| ProcessorError::TaskNotFound(id.clone()))?;
            if task.status != TaskStatus::Pending {
                return Err(ProcessorError::NotCancellable {
                    id: id.clone(),
                    status: task.status,
                });
            }
        }
        // finish re-checks under the lock; a worker that won the race turns
        // this into InvalidTransition, reported as NotCancellable.
        self.finish(id, TaskStatus::Cancelled, None, publish)
            .map_err(|e| match e {
                ProcessorError::InvalidTransition { id, from, .. } => {
                    ProcessorError::NotCancellable { id, status: from }
                }
                other => other,
            })
    }

    pub fn get_status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.lock().tasks.get(id).map(|t| t.status)
    }

    pub fn get(&self, id: &TaskId) -> Option<Task> {
        self.lock().tasks.get(id).cloned()
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.lock().tasks.contains_key(id)
    }

    /// Garbage-collect terminal entries completed more than `age` ago.
    pub fn remove_if_older_than(&self, age: Duration) -> Vec<TaskId> {
        let Ok(age) = chrono::Duration::from_std(age) else {
            return Vec::new();
        };
        let cutoff = self.clock.now() - age;

        let mut state = self.lock();
        let expired: Vec<TaskId> = state
            .tasks
            .values()
            .filter(|t| t.status.is_terminal())
            .filter(|t| t.completed_at.is_some_and(|at| at < cutoff))
            .map(|t| t.id.clone())
            .collect();
        for id in &expired {
            state.tasks.remove(id);
        }
        expired
    }

    /// Ids currently in any of `statuses`.
    pub fn ids_in(&self, statuses: &[TaskStatus]) -> Vec<TaskId> {
        self.lock()
            .tasks
            .values()
            .filter(|t| statuses.contains(&t.status))
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn counts(&self) -> StatusCounts {
        let state = self.lock();
        let mut counts = StatusCounts::default();
        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Processing => counts.processing += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    /// Number of non-terminal tasks.
    pub fn open_count(&self) -> usize {
        self.lock().open
    }

    /// Watch the number of non-terminal tasks.
    pub fn subscribe_open(&self) -> watch::Receiver<usize> {
        self.open_tx.subscribe()
    }

    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
