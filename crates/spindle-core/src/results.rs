//! Result store: terminal outcomes, readable with or without blocking.
//!
//! Each task id owns a slot holding a `watch` channel of `Option<TaskResult>`.
//! Waiters subscribe to the slot and are woken when a result is published;
//! nobody polls.
//!
//! Policy: `put` overwrites an existing result and logs a warning. This only
//! happens on forced resubmission of a finished id.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;

use crate::domain::{TaskId, TaskResult};

type Slot = watch::Sender<Option<TaskResult>>;

#[derive(Default)]
pub struct ResultStore {
    slots: Mutex<HashMap<TaskId, Slot>>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Publish a result. Returns `true` if an earlier result was replaced.
    pub fn put(&self, result: TaskResult) -> bool {
        let mut slots = self.lock();
        let slot = slots
            .entry(result.task_id.clone())
            .or_insert_with(|| watch::channel(None).0);

        let task_id = result.task_id.clone();
        let previous = slot.send_replace(Some(result));
        let replaced = previous.is_some();
        if replaced {
            tracing::warn!(%task_id, "overwriting existing result");
        }
        replaced
    }

    /// Non-blocking lookup.
    pub fn get(&self, id: &TaskId) -> Option<TaskResult> {
        self.lock().get(id).and_then(|slot| slot.borrow().clone())
    }

    /// Clear the result of `id` without closing its slot, so current waiters
    /// keep waiting for the next publication. Returns whether a result was cleared.
    pub fn reset(&self, id: &TaskId) -> bool {
        let slots = self.lock();
        let Some(slot) = slots.get(id) else {
            return false;
        };
        slot.send_replace(None).is_some()
    }

    /// Wait up to `timeout` for the result of `id`.
    ///
    /// Returns `None` on timeout. A slot is created on demand, so waiting can
    /// start before the task is published; a slot left empty by the last
    /// waiter is dropped again.
    pub async fn wait(&self, id: &TaskId, timeout: Duration) -> Option<TaskResult> {
        let mut rx = {
            let mut slots = self.lock();
            slots
                .entry(id.clone())
                .or_insert_with(|| watch::channel(None).0)
                .subscribe()
        };

        let result = match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Ok(Ok(published)) => published.clone(),
            // Err(_) from the channel: the slot was removed by cleanup
            Ok(Err(_)) | Err(_) => None,
        };
        if result.is_none() {
            drop(rx);
            self.release_if_idle(id);
        }
        result
    }

    fn release_if_idle(&self, id: &TaskId) {
        let mut slots = self.lock();
        let idle = slots
            .get(id)
            .is_some_and(|slot| slot.borrow().is_none() && slot.receiver_count() == 0);
        if idle {
            slots.remove(id);
        }
    }

    /// Forget the slot for `id`, waking waiters with `None`.
    pub fn remove(&self, id: &TaskId) -> Option<TaskResult> {
        self.lock()
            .remove(id)
            .and_then(|slot| slot.borrow().clone())
    }

    /// Number of published results.
    pub fn len(&self) -> usize {
        self.lock().values().filter(|s| s.borrow().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
