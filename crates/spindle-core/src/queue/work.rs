//! Bounded priority work queue.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

use crate::domain::TaskId;
use crate::error::ProcessorError;

/// What the queue hands to a worker. Task state lives in the registry;
/// the queue only carries ids and ordering keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub task_id: TaskId,
    pub priority: i32,
}

impl QueueEntry {
    pub fn new(task_id: TaskId, priority: i32) -> Self {
        Self { task_id, priority }
    }
}

/// Heap entry: higher priority first, then lower sequence (FIFO).
#[derive(Debug, PartialEq, Eq)]
struct Ranked {
    entry: QueueEntry,
    seq: u64,
}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.entry
            .priority
            .cmp(&other.entry.priority)
            // Reverse: earlier submissions win ties
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState {
    heap: BinaryHeap<Ranked>,
    next_seq: u64,
    closed: bool,
}

/// Priority queue shared by the processor (producer) and workers (consumers).
///
/// - `push` fails fast with `QueueFull` instead of blocking.
/// - `pop` waits up to a timeout so workers can check for shutdown.
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl WorkQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_seq: 0,
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue a newly submitted task.
    pub fn push(&self, entry: QueueEntry) -> Result<(), ProcessorError> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(ProcessorError::ShuttingDown);
            }
            if state.heap.len() >= self.capacity {
                return Err(ProcessorError::QueueFull {
                    capacity: self.capacity,
                });
            }
            Self::insert(&mut state, entry);
        }
        // Notify outside the lock
        self.notify.notify_one();
        Ok(())
    }

    /// Re-enqueue a task that was already admitted (retry after backoff).
    ///
    /// Skips the capacity check: back-pressure applies to new work only.
    pub fn push_retry(&self, entry: QueueEntry) -> Result<(), ProcessorError> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(ProcessorError::ShuttingDown);
            }
            Self::insert(&mut state, entry);
        }
        self.notify.notify_one();
        Ok(())
    }

    fn insert(state: &mut QueueState, entry: QueueEntry) {
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Ranked { entry, seq });
    }

    /// Take the highest-priority entry without waiting.
    pub fn try_pop(&self) -> Option<QueueEntry> {
        self.lock().heap.pop().map(|r| r.entry)
    }

    /// Take the highest-priority entry, waiting up to `timeout`.
    ///
    /// Returns `None` on timeout, or immediately once the queue is closed and empty.
    pub async fn pop(&self, timeout: Duration) -> Option<QueueEntry> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // 先に待機登録してからチェックする（通知の取りこぼし防止）
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(ranked) = state.heap.pop() {
                    let more = !state.heap.is_empty();
                    drop(state);
                    if more {
                        // pass the baton so another idle worker picks up the rest
                        self.notify.notify_one();
                    }
                    return Some(ranked.entry);
                }
                if state.closed {
                    return None;
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Drop queued entries for `task_id` (cancellation). Returns how many were removed.
    pub fn remove(&self, task_id: &TaskId) -> usize {
        let mut state = self.lock();
        let before = state.heap.len();
        state.heap.retain(|r| &r.entry.task_id != task_id);
        before - state.heap.len()
    }

    /// Reject further pushes and wake every waiting worker.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Remove and return everything still queued, highest priority first.
    pub fn drain(&self) -> Vec<QueueEntry> {
        let mut state = self.lock();
        let heap = std::mem::take(&mut state.heap);
        heap.into_sorted_vec()
            .into_iter()
            .rev()
            .map(|r| r.entry)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
