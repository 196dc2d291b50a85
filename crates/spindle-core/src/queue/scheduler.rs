//! Retry scheduler: delayed re-enqueue of failed tasks.
//!
//! Workers never sleep through a backoff. They hand the task here and go back
//! to the queue; a single loop wakes at the earliest deadline and pushes due
//! tasks back onto the work queue.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::time::Instant;

use super::{QueueEntry, WorkQueue};
use crate::domain::TaskId;

/// Scheduled retry entry.
///
/// We use Reverse ordering so BinaryHeap acts as a min-heap (earliest first).
#[derive(Debug, PartialEq, Eq)]
struct Scheduled {
    due_at: Instant,
    entry: QueueEntry,
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering: earlier times have higher priority
        other.due_at.cmp(&self.due_at)
    }
}

pub struct RetryScheduler {
    scheduled: Mutex<BinaryHeap<Scheduled>>,
    notify: Notify,
    queue: Arc<WorkQueue>,
}

impl RetryScheduler {
    pub fn new(queue: Arc<WorkQueue>) -> Self {
        Self {
            scheduled: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            queue,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BinaryHeap<Scheduled>> {
        self.scheduled.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Re-enqueue `entry` after `delay`.
    pub fn schedule(&self, entry: QueueEntry, delay: Duration) {
        let due_at = Instant::now() + delay;
        self.lock().push(Scheduled { due_at, entry });
        self.notify.notify_one();
    }

    /// Forget any pending retry for `task_id`. Returns whether one was removed.
    pub fn unschedule(&self, task_id: &TaskId) -> bool {
        let mut heap = self.lock();
        let before = heap.len();
        heap.retain(|s| &s.entry.task_id != task_id);
        before != heap.len()
    }

    /// Ids currently waiting out a backoff.
    pub fn pending_ids(&self) -> Vec<TaskId> {
        self.lock().iter().map(|s| s.entry.task_id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Move due entries onto the work queue; returns the next deadline, if any.
    fn promote_due(&self) -> Option<Instant> {
        let now = Instant::now();
        let (due, next) = {
            let mut heap = self.lock();
            let mut due = Vec::new();
            while let Some(top) = heap.peek() {
                if top.due_at > now {
                    break; // Heap is sorted, so we can stop
                }
                if let Some(s) = heap.pop() {
                    due.push(s.entry);
                }
            }
            (due, heap.peek().map(|s| s.due_at))
        };

        // Queue lock is taken only after the scheduler lock is released
        for entry in due {
            let task_id = entry.task_id.clone();
            if let Err(e) = self.queue.push_retry(entry) {
                tracing::warn!(%task_id, error = %e, "dropping retry");
            } else {
                tracing::debug!(%task_id, "retry re-enqueued");
            }
        }
        next
    }

    /// Scheduler loop. Exits when `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::debug!("retry scheduler started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = self.promote_due();

            match next {
                Some(due_at) => {
                    tokio::select! {
                        res = shutdown.changed() => if res.is_err() { break },
                        _ = &mut notified => {},
                        _ = tokio::time::sleep_until(due_at) => {},
                    }
                }
                None => {
                    tokio::select! {
                        res = shutdown.changed() => if res.is_err() { break },
                        _ = &mut notified => {},
                    }
                }
            }
        }
        tracing::debug!(pending = self.len(), "retry scheduler stopped");
    }
}
