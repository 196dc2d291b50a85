//! Counters and status views.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

/// Registry snapshot: how many tasks sit in each status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Point-in-time processor metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    /// Tasks accepted by `submit`.
    pub submitted: u64,
    /// Tasks that ended Completed.
    pub completed: u64,
    /// Tasks that ended Failed (including abandoned at shutdown).
    pub failed: u64,
    /// Retries scheduled.
    pub retried: u64,
    /// Tasks cancelled before they ran.
    pub cancelled: u64,
    /// Entries waiting in the work queue.
    pub queue_depth: usize,
    /// Tasks waiting out a retry backoff.
    pub retry_backlog: usize,
    /// Workers currently executing a task body.
    pub active_workers: usize,
    /// Worker loops alive.
    pub live_workers: usize,
    /// Tasks in Processing status.
    pub processing: usize,
}

/// Monotonic counters shared by the processor and its workers.
#[derive(Debug, Default)]
pub struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    cancelled: AtomicU64,
    active_workers: AtomicUsize,
    live_workers: AtomicUsize,
}

impl Counters {
    pub fn submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark a worker busy until the guard drops.
    pub fn busy(&self) -> GaugeGuard<'_> {
        GaugeGuard::new(&self.active_workers)
    }

    /// Mark a worker loop alive until the guard drops.
    pub fn alive(&self) -> GaugeGuard<'_> {
        GaugeGuard::new(&self.live_workers)
    }

    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::Relaxed)
    }

    pub fn live_workers(&self) -> usize {
        self.live_workers.load(Ordering::Relaxed)
    }

    /// Fill the counter fields of a `Metrics` snapshot.
    pub fn snapshot(&self) -> Metrics {
        Metrics {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            active_workers: self.active_workers(),
            live_workers: self.live_workers(),
            ..Metrics::default()
        }
    }
}

/// Increments a gauge on creation and decrements it on drop.
#[derive(Debug)]
pub struct GaugeGuard<'a> {
    gauge: &'a AtomicUsize,
}

impl<'a> GaugeGuard<'a> {
    fn new(gauge: &'a AtomicUsize) -> Self {
        gauge.fetch_add(1, Ordering::Relaxed);
        Self { gauge }
    }
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.gauge.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauges_follow_guards() {
        let counters = Counters::default();
        {
            let _a = counters.busy();
            let _b = counters.busy();
            assert_eq!(counters.active_workers(), 2);
        }
        assert_eq!(counters.active_workers(), 0);
    }

    #[test]
    fn snapshot_reports_counters() {
        let counters = Counters::default();
        counters.submitted();
        counters.submitted();
        counters.completed();
        counters.retried();

        let m = counters.snapshot();
        assert_eq!(m.submitted, 2);
        assert_eq!(m.completed, 1);
        assert_eq!(m.retried, 1);
        assert_eq!(m.failed, 0);
    }
}
