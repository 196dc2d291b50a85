//! Shared state behind the processor and its workers.
//!
//! Everything that publishes a terminal outcome goes through
//! [`Engine::finish`] or [`Engine::cancel`], which keep the lock order
//! (registry, then result store) and fire callbacks only afterwards.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::{
    Decider, ErrorKind, Payload, Task, TaskFailure, TaskId, TaskResult, TaskStatus,
};
use crate::error::{ProcessorError, Result};
use crate::observability::Counters;
use crate::queue::{RetryScheduler, WorkQueue};
use crate::registry::TaskRegistry;
use crate::results::ResultStore;
use crate::runtime::Runtime;

pub(crate) struct Engine {
    pub registry: TaskRegistry,
    pub queue: Arc<WorkQueue>,
    pub results: ResultStore,
    pub scheduler: Arc<RetryScheduler>,
    pub runtime: Runtime,
    pub decider: Arc<dyn Decider>,
    pub counters: Counters,
    pub poll_interval: Duration,
}

impl Engine {
    /// Move `id` to its terminal status and publish the matching result.
    ///
    /// The status change and the result publication happen under the
    /// registry lock, so a caller woken by the result always observes the
    /// terminal status. The callback runs afterwards, outside every lock.
    pub fn finish(
        &self,
        id: &TaskId,
        outcome: std::result::Result<Payload, TaskFailure>,
        duration: Option<Duration>,
    ) -> Result<TaskResult> {
        let status = match &outcome {
            Ok(_) => TaskStatus::Completed,
            Err(f) if f.kind == ErrorKind::Cancelled => TaskStatus::Cancelled,
            Err(_) => TaskStatus::Failed,
        };
        let error = outcome.as_ref().err().map(|f| f.message.clone());

        let mut published = None;
        let task = self.registry.finish(id, status, error, |task| {
            let result = Self::result_for(task, outcome, duration);
            self.results.put(result.clone());
            published = Some(result);
        })?;

        let Some(result) = published else {
            return Err(ProcessorError::WorkerInternal(format!(
                "no result published for {id}"
            )));
        };
        self.count_terminal(status);
        dispatch_callback(&task, &result);
        Ok(result)
    }

    /// Cancel a Pending task: status, result, queue entry and callback.
    pub fn cancel(&self, id: &TaskId) -> Result<TaskResult> {
        let mut published = None;
        let task = self.registry.cancel_pending(id, |task| {
            let failure = TaskFailure::new(ErrorKind::Cancelled, "cancelled", task.retry_count);
            let result = Self::result_for(task, Err(failure), None);
            self.results.put(result.clone());
            published = Some(result);
        })?;

        self.queue.remove(id);
        self.scheduler.unschedule(id);

        let Some(result) = published else {
            return Err(ProcessorError::WorkerInternal(format!(
                "no result published for {id}"
            )));
        };
        self.count_terminal(TaskStatus::Cancelled);
        dispatch_callback(&task, &result);
        Ok(result)
    }

    /// Drop terminal tasks (and their results) completed more than `older_than` ago.
    pub fn cleanup(&self, older_than: Duration) -> usize {
        let removed = self.registry.remove_if_older_than(older_than);
        for id in &removed {
            self.results.remove(id);
        }
        if !removed.is_empty() {
            tracing::debug!(removed = removed.len(), "cleaned up finished tasks");
        }
        removed.len()
    }

    fn result_for(
        task: &Task,
        outcome: std::result::Result<Payload, TaskFailure>,
        duration: Option<Duration>,
    ) -> TaskResult {
        let result = match outcome {
            Ok(payload) => TaskResult::success(task.id.clone(), payload, task.attempts),
            Err(failure) => TaskResult::failure(task.id.clone(), failure, task.attempts),
        };
        match duration {
            Some(d) => result.with_duration(d),
            None => result,
        }
    }

    fn count_terminal(&self, status: TaskStatus) {
        match status {
            TaskStatus::Completed => self.counters.completed(),
            TaskStatus::Failed => self.counters.failed(),
            TaskStatus::Cancelled => self.counters.cancelled(),
            TaskStatus::Pending | TaskStatus::Processing => {}
        }
    }
}

/// Run the task's callback on its own tokio task.
///
/// The caller holds no locks at this point; spawning additionally keeps a
/// slow or re-entrant callback off the worker.
fn dispatch_callback(task: &Task, result: &TaskResult) {
    let Some(callback) = task.callback.clone() else {
        return;
    };
    let result = result.clone();
    let run = move || {
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| callback(&result)));
        if outcome.is_err() {
            tracing::error!(task_id = %result.task_id, "completion callback panicked");
        }
    };

    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { run() });
        }
        // outside a runtime (sync caller): no locks are held, run inline
        Err(_) => run(),
    }
}
