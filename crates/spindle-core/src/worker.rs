use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::domain::{Decision, ErrorKind, TaskFailure, TaskId};
use crate::engine::Engine;
use crate::error::{ProcessorError, Result};
use crate::queue::QueueEntry;
use crate::runtime::AbortOnDrop;

/// Worker pool handle.
/// - 各スロットは supervisor が持ち、worker loop が panic したら作り直す
/// - shutdown は `watch` で通知し、`join()` で期限付きで終了を待つ
pub struct WorkerPool {
    slots: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `n` supervised workers.
    pub(crate) fn spawn(
        n: usize,
        engine: Arc<Engine>,
        shutdown_rx: watch::Receiver<bool>,
        respawn: bool,
    ) -> Self {
        let slots = (0..n)
            .map(|worker_id| {
                let engine = Arc::clone(&engine);
                let rx = shutdown_rx.clone();
                tokio::spawn(supervise(worker_id, engine, rx, respawn))
            })
            .collect();
        Self { slots }
    }

    /// Wait for every worker to exit, up to `deadline`.
    ///
    /// Returns `true` if all of them finished in time. Workers that did not
    /// stay in the pool so `abort` can stop them.
    pub async fn join(&mut self, deadline: Instant) -> bool {
        let mut remaining = Vec::new();
        for mut slot in self.slots.drain(..) {
            if tokio::time::timeout_at(deadline, &mut slot).await.is_err() {
                remaining.push(slot);
            }
        }
        let all_done = remaining.is_empty();
        self.slots = remaining;
        all_done
    }

    /// Abort workers still running and wait until they are gone.
    pub async fn abort(&mut self) {
        for slot in &self.slots {
            slot.abort();
        }
        for slot in self.slots.drain(..) {
            let _ = slot.await;
        }
    }
}

async fn supervise(
    worker_id: usize,
    engine: Arc<Engine>,
    shutdown_rx: watch::Receiver<bool>,
    respawn: bool,
) {
    loop {
        // aborting the supervisor also aborts the loop it is watching
        let worker = AbortOnDrop::new(tokio::spawn(worker_loop(
            worker_id,
            Arc::clone(&engine),
            shutdown_rx.clone(),
        )));

        match worker.await {
            Ok(()) => break,
            Err(e) if e.is_panic() => {
                tracing::error!(worker_id, "worker loop panicked");
                if !respawn || *shutdown_rx.borrow() {
                    break;
                }
                tracing::warn!(worker_id, "respawning worker");
            }
            Err(_) => break,
        }
    }
}

async fn worker_loop(worker_id: usize, engine: Arc<Engine>, mut shutdown_rx: watch::Receiver<bool>) {
    let _alive = engine.counters.alive();
    tracing::debug!(worker_id, "worker started");

    loop {
        // shutdown が来ていたら抜ける
        if *shutdown_rx.borrow() {
            break;
        }

        // pop は待つので shutdown と競合させる (pop は cancel-safe)
        let entry = tokio::select! {
            res = shutdown_rx.changed() => {
                if res.is_err() {
                    break;
                }
                continue;
            }
            entry = engine.queue.pop(engine.poll_interval) => entry,
        };

        let Some(entry) = entry else {
            continue;
        };

        if let Err(e) = process(worker_id, &engine, entry).await {
            tracing::error!(worker_id, error = %e, "worker internal error");
        }
    }

    tracing::debug!(worker_id, "worker stopped");
}

/// Run one attempt of the task behind `entry` and record what happened.
async fn process(worker_id: usize, engine: &Engine, entry: QueueEntry) -> Result<()> {
    let task = match engine.registry.mark_processing(&entry.task_id) {
        Ok(task) => task,
        Err(
            e @ (ProcessorError::AlreadyProcessing(_)
            | ProcessorError::TaskNotFound(_)
            | ProcessorError::InvalidTransition { .. }),
        ) => {
            tracing::debug!(worker_id, task_id = %entry.task_id, reason = %e, "skipping queue entry");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let _busy = engine.counters.busy();
    let mut guard = ProcessingGuard::new(engine, &task.id, task.retry_count);

    tracing::debug!(worker_id, task_id = %task.id, attempt = task.attempts, "executing task");
    let exec = engine.runtime.execute(&task).await;

    match exec.outcome {
        Ok(payload) => {
            engine.finish(&task.id, Ok(payload), Some(exec.duration))?;
            tracing::info!(
                worker_id,
                task_id = %task.id,
                attempt = task.attempts,
                elapsed_ms = exec.duration.as_millis() as u64,
                "task completed"
            );
        }
        Err(failure) => match engine.decider.decide(&task, &failure) {
            Decision::Retry { delay, reason } => {
                engine.registry.requeue_for_retry(&task.id, failure.message.clone())?;
                engine
                    .scheduler
                    .schedule(QueueEntry::new(task.id.clone(), task.priority), delay);
                engine.counters.retried();
                tracing::warn!(
                    worker_id,
                    task_id = %task.id,
                    attempt = task.attempts,
                    delay_ms = delay.as_millis() as u64,
                    %reason,
                    "task failed, retry scheduled"
                );
            }
            Decision::Fail { reason } => {
                let kind = failure.kind;
                engine.finish(&task.id, Err(failure), Some(exec.duration))?;
                tracing::error!(
                    worker_id,
                    task_id = %task.id,
                    attempt = task.attempts,
                    ?kind,
                    %reason,
                    "task failed"
                );
            }
        },
    }

    guard.disarm();
    Ok(())
}

/// Keeps a claimed task from staying Processing forever.
///
/// If dropped while armed (worker aborted, panicked, or bailed out with an
/// error), the task is failed with an `Abandoned` result.
struct ProcessingGuard<'a> {
    engine: &'a Engine,
    task_id: &'a TaskId,
    retry_count: u32,
    armed: bool,
}

impl<'a> ProcessingGuard<'a> {
    fn new(engine: &'a Engine, task_id: &'a TaskId, retry_count: u32) -> Self {
        Self {
            engine,
            task_id,
            retry_count,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let failure = TaskFailure::new(
            ErrorKind::Abandoned,
            "worker stopped before the task finished",
            self.retry_count,
        );
        // the task may already be terminal (shutdown sweep got there first)
        match self.engine.finish(self.task_id, Err(failure), None) {
            Ok(_) => tracing::warn!(task_id = %self.task_id, "abandoned in-flight task"),
            Err(e) => tracing::debug!(task_id = %self.task_id, reason = %e, "no repair needed"),
        }
    }
}
