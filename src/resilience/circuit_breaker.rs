// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker for the primary score store.
//!
//! Tracks primary call outcomes in a count-based sliding window and trips
//! when the failure rate crosses a threshold, so that callers are answered
//! by the local fallback instead of waiting on a sick Redis.
//!
//! States:
//! - Closed: Normal operation, calls go to the primary
//! - Open: Primary unhealthy, calls are rejected (caller uses the fallback)
//! - HalfOpen: A limited number of trial calls probe the primary
//!
//! ```text
//! Closed ──(window full enough, failure% >= threshold)──▶ Open
//! Open ──(open_wait elapsed, checked lazily)──▶ HalfOpen
//! HalfOpen ──(all permitted trials succeed)──▶ Closed   (recovery epoch += 1)
//! HalfOpen ──(any trial fails)──▶ Open
//! ```
//!
//! State changes are published on a `watch` channel; recoveries bump a
//! separate epoch channel so a listener sees every HalfOpen→Closed even if
//! it was not polling at the time.
//!
//! A trial call whose future is dropped before it settles (caller
//! cancelled, task aborted) hands its slot back, so the next call tries
//! the primary instead of the circuit staying half-open.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Circuit breaker state for metrics/monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Error type for circuit-protected operations
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit breaker rejected the call (circuit is open)
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The call did not finish within the configured timeout
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The underlying operation failed
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Failure percentage (0-100] that trips the circuit
    pub failure_rate_threshold: f32,
    /// Number of most recent outcomes considered
    pub sliding_window_size: usize,
    /// Outcomes required before the rate is evaluated
    pub minimum_calls: usize,
    /// How long to stay open before probing (half-open)
    pub open_wait: Duration,
    /// Trial calls admitted while half-open; all must succeed to close
    pub half_open_permitted_calls: u32,
    /// Upper bound for a single protected call
    pub call_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            sliding_window_size: 10,
            minimum_calls: 5,
            open_wait: Duration::from_secs(30),
            half_open_permitted_calls: 3,
            call_timeout: Duration::from_millis(500),
        }
    }
}

impl CircuitConfig {
    /// Trips faster, recovers cautiously
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            failure_rate_threshold: 25.0,
            sliding_window_size: 8,
            minimum_calls: 3,
            open_wait: Duration::from_secs(60),
            half_open_permitted_calls: 5,
            call_timeout: Duration::from_millis(250),
        }
    }

    /// Tolerates more failures before tripping
    #[must_use]
    pub fn lenient() -> Self {
        Self {
            failure_rate_threshold: 80.0,
            sliding_window_size: 20,
            minimum_calls: 10,
            open_wait: Duration::from_secs(15),
            half_open_permitted_calls: 1,
            call_timeout: Duration::from_secs(1),
        }
    }

    /// Fast recovery for testing
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            sliding_window_size: 4,
            minimum_calls: 2,
            open_wait: Duration::from_millis(50),
            half_open_permitted_calls: 1,
            call_timeout: Duration::from_millis(100),
        }
    }
}

/// Where a call should be sent, decided before it is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Send to the primary; `trial` calls decide the half-open outcome.
    /// `generation` identifies the state the call was admitted under.
    Primary { trial: bool, generation: u64 },
    /// Circuit open (or half-open with no trial slots left)
    Rejected,
}

struct BreakerInner {
    state: CircuitState,
    /// Recent outcomes while closed, `true` = failure
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    trials_admitted: u32,
    trial_successes: u32,
    /// Bumped on every transition; outcomes from older generations are stale
    generation: u64,
}

/// A named circuit breaker with metrics tracking
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    inner: Mutex<BreakerInner>,
    state_tx: watch::Sender<CircuitState>,
    recovery_tx: watch::Sender<u64>,

    // Metrics
    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and config
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let (state_tx, _) = watch::channel(CircuitState::Closed);
        let (recovery_tx, _) = watch::channel(0u64);
        let window = VecDeque::with_capacity(config.sliding_window_size);

        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                window,
                opened_at: None,
                trials_admitted: 0,
                trial_successes: 0,
                generation: 0,
            }),
            state_tx,
            recovery_tx,
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    /// Get the circuit breaker name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Current state, promoting Open to HalfOpen once the wait has elapsed.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.promote_if_waited(&mut inner);
        inner.state
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<CircuitState> {
        self.state_tx.subscribe()
    }

    /// Watch the recovery epoch, bumped on every HalfOpen→Closed.
    pub fn subscribe_recoveries(&self) -> watch::Receiver<u64> {
        self.recovery_tx.subscribe()
    }

    /// Number of HalfOpen→Closed transitions so far.
    #[must_use]
    pub fn recoveries(&self) -> u64 {
        *self.recovery_tx.borrow()
    }

    /// Decide where the next call goes. Every `Primary` admission must be
    /// followed by exactly one [`on_success`](Self::on_success),
    /// [`on_failure`](Self::on_failure) or [`on_abandoned`](Self::on_abandoned).
    pub fn admit(&self) -> Admission {
        self.calls_total.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        self.promote_if_waited(&mut inner);

        let generation = inner.generation;
        let admission = match inner.state {
            CircuitState::Closed => Admission::Primary { trial: false, generation },
            CircuitState::HalfOpen if inner.trials_admitted < self.config.half_open_permitted_calls => {
                inner.trials_admitted += 1;
                Admission::Primary { trial: true, generation }
            }
            CircuitState::HalfOpen | CircuitState::Open => Admission::Rejected,
        };

        if admission == Admission::Rejected {
            self.rejections.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_circuit_call(&self.name, "rejected");
        }
        admission
    }

    /// Record a successful primary call.
    pub fn on_success(&self, admission: Admission) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_circuit_call(&self.name, "success");

        let mut inner = self.inner.lock();
        if !Self::is_current(&inner, admission) {
            return;
        }
        match (inner.state, admission) {
            (CircuitState::Closed, Admission::Primary { trial: false, .. }) => {
                self.push_outcome(&mut inner, false);
            }
            (CircuitState::HalfOpen, Admission::Primary { trial: true, .. }) => {
                inner.trial_successes += 1;
                if inner.trial_successes >= self.config.half_open_permitted_calls {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            _ => {}
        }
    }

    /// Record a failed (or timed out) primary call.
    pub fn on_failure(&self, admission: Admission) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_circuit_call(&self.name, "failure");

        let mut inner = self.inner.lock();
        if !Self::is_current(&inner, admission) {
            return;
        }
        match (inner.state, admission) {
            (CircuitState::Closed, Admission::Primary { trial: false, .. }) => {
                self.push_outcome(&mut inner, true);
                if self.should_trip(&inner) {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            (CircuitState::HalfOpen, Admission::Primary { trial: true, .. }) => {
                self.transition(&mut inner, CircuitState::Open);
            }
            _ => {}
        }
    }

    /// Record a primary call that never settled (its future was dropped).
    /// No outcome is counted; a trial slot is handed back.
    pub fn on_abandoned(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        if !Self::is_current(&inner, admission) {
            return;
        }
        if let (CircuitState::HalfOpen, Admission::Primary { trial: true, .. }) = (inner.state, admission) {
            inner.trials_admitted = inner.trials_admitted.saturating_sub(1);
            debug!(circuit = %self.name, "Trial call abandoned, slot released");
        }
    }

    /// Outcome belongs to the state generation it was admitted under.
    fn is_current(inner: &BreakerInner, admission: Admission) -> bool {
        matches!(admission, Admission::Primary { generation, .. } if generation == inner.generation)
    }

    /// Execute an async operation through the circuit breaker.
    ///
    /// Takes a closure that returns a Future, so nothing is started when
    /// the circuit rejects the call. Timeouts count as failures.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = self.admit();
        if admission == Admission::Rejected {
            return Err(CircuitError::Rejected);
        }
        let pending = PendingCall { breaker: self, admission, settled: false };

        match tokio::time::timeout(self.config.call_timeout, f()).await {
            Ok(Ok(result)) => {
                pending.settle(true);
                Ok(result)
            }
            Ok(Err(e)) => {
                debug!(circuit = %self.name, "Circuit call failed");
                pending.settle(false);
                Err(CircuitError::Inner(e))
            }
            Err(_) => {
                debug!(circuit = %self.name, timeout = ?self.config.call_timeout, "Circuit call timed out");
                crate::metrics::record_timeout(&self.name);
                pending.settle(false);
                Err(CircuitError::Timeout(self.config.call_timeout))
            }
        }
    }

    fn push_outcome(&self, inner: &mut BreakerInner, failed: bool) {
        if inner.window.len() == self.config.sliding_window_size {
            inner.window.pop_front();
        }
        inner.window.push_back(failed);
    }

    fn should_trip(&self, inner: &BreakerInner) -> bool {
        let recorded = inner.window.len();
        if recorded < self.config.minimum_calls || recorded == 0 {
            return false;
        }
        let failed = inner.window.iter().filter(|f| **f).count();
        let rate = failed as f32 * 100.0 / recorded as f32;
        rate >= self.config.failure_rate_threshold
    }

    fn promote_if_waited(&self, inner: &mut BreakerInner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let waited = inner
            .opened_at
            .map_or(true, |at| at.elapsed() >= self.config.open_wait);
        if waited {
            self.transition(inner, CircuitState::HalfOpen);
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        inner.generation += 1;

        match to {
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
                warn!(circuit = %self.name, %from, wait = ?self.config.open_wait, "Circuit opened, serving from fallback");
            }
            CircuitState::HalfOpen => {
                inner.trials_admitted = 0;
                inner.trial_successes = 0;
                info!(circuit = %self.name, "Circuit half-open, probing primary");
            }
            CircuitState::Closed => {
                inner.window.clear();
                inner.opened_at = None;
                info!(circuit = %self.name, %from, "Circuit closed, primary recovered");
            }
        }

        crate::metrics::set_circuit_state(&self.name, to as u8);
        self.state_tx.send_replace(to);
        if from == CircuitState::HalfOpen && to == CircuitState::Closed {
            self.recovery_tx.send_modify(|epoch| *epoch += 1);
        }
    }

    /// Get total number of calls
    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    /// Get number of successful calls
    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Get number of failed calls (errors and timeouts)
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Get number of rejected calls (served by the fallback)
    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Get failure rate over all calls (0.0 - 1.0)
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let total = self.calls_total();
        if total == 0 {
            return 0.0;
        }
        self.failures() as f64 / total as f64
    }

    /// Reset all metrics
    pub fn reset_metrics(&self) {
        self.calls_total.store(0, Ordering::Relaxed);
        self.successes.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.rejections.store(0, Ordering::Relaxed);
    }
}

/// An admitted call in flight. Dropped unsettled, it is reported as
/// abandoned.
struct PendingCall<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl PendingCall<'_> {
    fn settle(mut self, success: bool) {
        self.settled = true;
        if success {
            self.breaker.on_success(self.admission);
        } else {
            self.breaker.on_failure(self.admission);
        }
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_abandoned(self.admission);
        }
    }
}
