//! Processor: the public face of the engine.
//!
//! Lifecycle: `builder()` -> `build()` -> `start()` -> `submit()`... ->
//! `shutdown()`. Submissions are accepted from `build()` on; they sit in the
//! queue until `start()` spawns the workers.

mod builder;
mod gc_loop;
#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub use builder::ProcessorBuilder;

use crate::config::ProcessorConfig;
use crate::domain::{ErrorKind, Outcome, Task, TaskFailure, TaskId, TaskResult, TaskStatus};
use crate::engine::Engine;
use crate::error::{ProcessorError, Result};
use crate::observability::{Metrics, StatusCounts};
use crate::queue::QueueEntry;
use crate::worker::WorkerPool;

const RUNNING: u8 = 0;
const SHUTTING_DOWN: u8 = 1;
const STOPPED: u8 = 2;

/// Options for [`Processor::submit_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitOptions {
    /// Replace a finished task that has the same id.
    pub force: bool,
}

/// What `shutdown` had to give up on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Tasks marked Failed (`Abandoned`) because they did not finish in time.
    pub abandoned: Vec<TaskId>,
    /// `true` if every task and worker finished before the deadline.
    pub completed_in_time: bool,
}

/// Handle to a running processor. Cheap to clone.
#[derive(Clone)]
pub struct Processor {
    inner: Arc<Inner>,
}

struct Inner {
    engine: Arc<Engine>,
    config: ProcessorConfig,
    state: AtomicU8,
    shutdown_tx: watch::Sender<bool>,
    background: Mutex<Background>,
    report: tokio::sync::Mutex<Option<ShutdownReport>>,
}

#[derive(Default)]
struct Background {
    started: bool,
    pool: Option<WorkerPool>,
    scheduler: Option<JoinHandle<()>>,
    gc: Option<JoinHandle<()>>,
}

impl Processor {
    pub fn builder() -> ProcessorBuilder {
        ProcessorBuilder::new()
    }

    fn from_engine(engine: Engine, config: ProcessorConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                engine: Arc::new(engine),
                config,
                state: AtomicU8::new(RUNNING),
                shutdown_tx,
                background: Mutex::new(Background::default()),
                report: tokio::sync::Mutex::new(None),
            }),
        }
    }

    fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    fn background(&self) -> MutexGuard<'_, Background> {
        self.inner.background.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.inner.config
    }

    /// Spawn the worker pool, the retry scheduler and, when retention is
    /// configured, the cleanup loop. Must be called inside a tokio runtime.
    /// Calling it again is a no-op.
    pub fn start(&self) -> Result<()> {
        if self.inner.state.load(Ordering::SeqCst) != RUNNING {
            return Err(ProcessorError::ShuttingDown);
        }
        tokio::runtime::Handle::try_current()
            .map_err(|e| ProcessorError::WorkerInternal(format!("start needs a tokio runtime: {e}")))?;

        let mut bg = self.background();
        if bg.started {
            return Ok(());
        }

        let config = &self.inner.config;
        let engine = &self.inner.engine;
        let shutdown_rx = self.inner.shutdown_tx.subscribe();

        bg.scheduler = Some(tokio::spawn(
            Arc::clone(&engine.scheduler).run(shutdown_rx.clone()),
        ));
        bg.pool = Some(WorkerPool::spawn(
            config.workers,
            Arc::clone(engine),
            shutdown_rx.clone(),
            config.respawn_workers,
        ));
        bg.gc = config.retention().map(|retention| {
            tokio::spawn(gc_loop::run(
                Arc::clone(engine),
                retention,
                config.cleanup_interval(),
                shutdown_rx,
            ))
        });
        bg.started = true;

        tracing::info!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            "processor started"
        );
        Ok(())
    }

    /// Accept a task. Never blocks: a full queue is `QueueFull`.
    pub fn submit(&self, task: Task) -> Result<TaskId> {
        self.submit_with(task, SubmitOptions::default())
    }

    pub fn submit_with(&self, mut task: Task, opts: SubmitOptions) -> Result<TaskId> {
        if self.inner.state.load(Ordering::SeqCst) != RUNNING {
            return Err(ProcessorError::ShuttingDown);
        }
        if task.max_retries.is_none() {
            task.max_retries = Some(self.inner.config.default_max_retries);
        }

        let engine = self.engine();
        let id = task.id.clone();
        let entry = QueueEntry::new(id.clone(), task.priority);

        // a forced replacement drops the previous result before the new run is visible
        engine
            .registry
            .register_replacing(task, opts.force, |id| {
                engine.results.reset(id);
            })?;
        if let Err(e) = engine.queue.push(entry) {
            engine.registry.discard_pending(&id);
            tracing::warn!(task_id = %id, error = %e, "task rejected");
            return Err(e);
        }

        engine.counters.submitted();
        tracing::debug!(task_id = %id, "task submitted");
        Ok(id)
    }

    /// Non-blocking result lookup.
    pub fn get_result(&self, id: &TaskId) -> Option<TaskResult> {
        self.engine().results.get(id)
    }

    /// Wait up to `timeout` for the result of `id`. `Ok(None)` on timeout.
    pub async fn wait_for_result(
        &self,
        id: &TaskId,
        timeout: Duration,
    ) -> Result<Option<TaskResult>> {
        let engine = self.engine();
        if !engine.registry.contains(id) && engine.results.get(id).is_none() {
            return Err(ProcessorError::TaskNotFound(id.clone()));
        }
        Ok(engine.results.wait(id, timeout).await)
    }

    pub fn get_status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.engine().registry.get_status(id)
    }

    /// Cancel a task that has not started yet. Returns whether it was cancelled.
    pub fn cancel(&self, id: &TaskId) -> bool {
        self.try_cancel(id).is_ok()
    }

    /// Like [`cancel`](Self::cancel), but says why it could not.
    pub fn try_cancel(&self, id: &TaskId) -> Result<()> {
        self.engine().cancel(id)?;
        tracing::info!(task_id = %id, "task cancelled");
        Ok(())
    }

    pub fn get_metrics(&self) -> Metrics {
        let engine = self.engine();
        Metrics {
            queue_depth: engine.queue.len(),
            retry_backlog: engine.scheduler.len(),
            processing: engine.registry.counts().processing,
            ..engine.counters.snapshot()
        }
    }

    pub fn status_counts(&self) -> StatusCounts {
        self.engine().registry.counts()
    }

    /// Remove finished tasks and their results older than `older_than`.
    pub fn cleanup(&self, older_than: Duration) -> usize {
        self.engine().cleanup(older_than)
    }

    /// Stop accepting work, drain, then stop.
    ///
    /// Queued and in-flight tasks get until `timeout` to finish. After that the
    /// workers are aborted and every task still Pending or Processing is
    /// failed with `ErrorKind::Abandoned`. Calling it again returns the first
    /// report; concurrent callers wait for the first one.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        let mut report = self.inner.report.lock().await;
        if let Some(done) = report.as_ref() {
            return done.clone();
        }

        self.inner.state.store(SHUTTING_DOWN, Ordering::SeqCst);
        let deadline = Instant::now() + timeout;
        tracing::info!(timeout_ms = timeout.as_millis() as u64, "shutting down");

        let bg = std::mem::take(&mut *self.background());
        let mut settled = true;

        if bg.started {
            let mut open = self.engine().registry.subscribe_open();
            let drained = matches!(
                tokio::time::timeout_at(deadline, open.wait_for(|n| *n == 0)).await,
                Ok(Ok(_))
            );
            settled = drained;
        }

        let _ = self.inner.shutdown_tx.send(true);
        self.engine().queue.close();

        let mut candidates = Vec::new();
        if let Some(mut pool) = bg.pool {
            if !pool.join(deadline).await {
                settled = false;
            }
            // collected before the abort: an aborted worker's guard may fail
            // its task before the sweep below gets to it
            candidates = self.open_ids();
            pool.abort().await;
            self.sweep(&candidates);
        }
        for mut handle in [bg.scheduler, bg.gc].into_iter().flatten() {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                handle.abort();
                let _ = handle.await;
            }
        }

        let leftovers = self.open_ids();
        self.engine().queue.drain();
        self.sweep(&leftovers);
        for id in leftovers {
            if !candidates.contains(&id) {
                candidates.push(id);
            }
        }

        let abandoned: Vec<TaskId> = candidates
            .into_iter()
            .filter(|id| self.was_abandoned(id))
            .collect();

        let done = ShutdownReport {
            completed_in_time: settled && abandoned.is_empty(),
            abandoned,
        };
        self.inner.state.store(STOPPED, Ordering::SeqCst);
        tracing::info!(
            abandoned = done.abandoned.len(),
            completed_in_time = done.completed_in_time,
            "processor stopped"
        );
        *report = Some(done.clone());
        done
    }

    fn open_ids(&self) -> Vec<TaskId> {
        self.engine()
            .registry
            .ids_in(&[TaskStatus::Pending, TaskStatus::Processing])
    }

    fn was_abandoned(&self, id: &TaskId) -> bool {
        self.engine().results.get(id).is_some_and(|r| {
            matches!(&r.outcome, Outcome::Failure(f) if f.kind == ErrorKind::Abandoned)
        })
    }

    fn sweep(&self, ids: &[TaskId]) {
        for id in ids {
            let retry_count = self
                .engine()
                .registry
                .get(id)
                .map(|t| t.retry_count)
                .unwrap_or(0);
            let failure = TaskFailure::new(
                ErrorKind::Abandoned,
                "processor shut down before the task finished",
                retry_count,
            );
            if self.engine().finish(id, Err(failure), None).is_ok() {
                tracing::warn!(task_id = %id, "abandoned at shutdown");
            }
        }
    }
}
