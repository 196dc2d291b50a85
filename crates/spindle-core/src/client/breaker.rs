//! Circuit breaker.
//!
//! Closed: calls flow; consecutive failures are counted.
//! Open: calls are refused until `cooldown` has passed.
//! HalfOpen: up to `half_open_max_calls` probes; one success closes the
//! circuit, one failure re-opens it.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    half_open_max_calls: u32,
    inner: Mutex<BreakerState>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probes_in_flight: u32,
    /// Bumped on every Open -> HalfOpen so stale probes can be told apart.
    generation: u64,
}

/// A granted call. Resolve it with [`success`](Permit::success) or
/// [`failure`](Permit::failure); dropping it unresolved (e.g. the caller's
/// future was cancelled) frees the probe slot without a verdict.
#[must_use = "an unresolved permit says nothing about the dependency"]
#[derive(Debug)]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    /// Set when the permit is a HalfOpen probe.
    probe: Option<u64>,
    resolved: bool,
}

impl Permit<'_> {
    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.record_success();
    }

    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.record_failure();
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        if let Some(generation) = self.probe {
            self.breaker.release_probe(generation);
        }
    }
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration, half_open_max_calls: u32) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            half_open_max_calls: half_open_max_calls.max(1),
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probes_in_flight: 0,
                generation: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cooled_down(&self, s: &BreakerState) -> bool {
        s.opened_at
            .is_none_or(|at| at.elapsed() >= self.cooldown)
    }

    /// Would `allow` let a call through right now? Does not change state.
    pub fn permits(&self) -> bool {
        let s = self.lock();
        match s.state {
            CircuitState::Closed => true,
            CircuitState::Open => self.cooled_down(&s),
            CircuitState::HalfOpen => s.probes_in_flight < self.half_open_max_calls,
        }
    }

    /// Ask to make a call. `None` means the circuit refuses it.
    ///
    /// In HalfOpen the permit holds one of the `half_open_max_calls` probe
    /// slots until it is resolved or dropped.
    pub fn allow(&self) -> Option<Permit<'_>> {
        let mut s = self.lock();
        let probe = match s.state {
            CircuitState::Closed => None,
            CircuitState::Open => {
                if !self.cooled_down(&s) {
                    return None;
                }
                s.state = CircuitState::HalfOpen;
                s.generation += 1;
                s.probes_in_flight = 1;
                tracing::info!("circuit half-open, probing");
                Some(s.generation)
            }
            CircuitState::HalfOpen => {
                if s.probes_in_flight >= self.half_open_max_calls {
                    return None;
                }
                s.probes_in_flight += 1;
                Some(s.generation)
            }
        };
        Some(Permit {
            breaker: self,
            probe,
            resolved: false,
        })
    }

    fn release_probe(&self, generation: u64) {
        let mut s = self.lock();
        if s.state == CircuitState::HalfOpen && s.generation == generation {
            s.probes_in_flight = s.probes_in_flight.saturating_sub(1);
            tracing::debug!("probe abandoned, slot released");
        }
    }

    pub fn record_success(&self) {
        let mut s = self.lock();
        match s.state {
            CircuitState::Closed => s.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                s.state = CircuitState::Closed;
                s.consecutive_failures = 0;
                s.probes_in_flight = 0;
                s.opened_at = None;
                tracing::info!("circuit closed");
            }
            // late answer from a call made before the circuit opened
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut s = self.lock();
        match s.state {
            CircuitState::Closed => {
                s.consecutive_failures += 1;
                if s.consecutive_failures >= self.failure_threshold {
                    Self::trip(&mut s);
                    tracing::warn!(
                        failures = s.consecutive_failures,
                        cooldown_ms = self.cooldown.as_millis() as u64,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                Self::trip(&mut s);
                tracing::warn!("probe failed, circuit re-opened");
            }
            CircuitState::Open => {}
        }
    }

    fn trip(s: &mut BreakerState) {
        s.state = CircuitState::Open;
        s.opened_at = Some(Instant::now());
        s.probes_in_flight = 0;
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }
}
