//! Circuit breaker implementation with lock-free atomics
//!
//! One breaker per breaker key. Transitions are compare-and-swap on a single
//! shared record; no lock is held across the guarded call. Open calls fail
//! fast with `CircuitOpen` without invoking the underlying operation.
//!
//! Recovery: after `open_duration` the first caller is admitted as a probe
//! (at most `half_open_max_concurrency` concurrently). `success_threshold`
//! consecutive probe successes close the breaker; any probe failure reopens
//! it with the open duration escalated by `open_backoff_factor` up to
//! `open_duration_cap`. A completed recovery resets the duration to its
//! configured base.

use crate::clock::{Clock, MonotonicClock};
use crate::config::BreakerConfig;
use crate::error::CoreError;
use crate::telemetry::{BreakerEvent, BreakerReason, CoreEvent, EventBus};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Observable breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            STATE_CLOSED => CircuitState::Closed,
            STATE_OPEN => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }
}

/// Point-in-time view of one breaker, for health snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub key: String,
    pub state: CircuitState,
    pub consecutive_failures: usize,
    /// Current (possibly escalated) open window.
    pub open_duration: Duration,
    /// How long the breaker has been open, when it is.
    pub open_for: Option<Duration>,
}

struct BreakerShared {
    state: AtomicU8,
    consecutive_failures: AtomicUsize,
    half_open_calls: AtomicUsize,
    half_open_successes: AtomicUsize,
    opened_at_millis: AtomicU64,
    open_duration_millis: AtomicU64,
}

/// Fault-isolating gate for one breaker key.
#[derive(Clone)]
pub struct CircuitBreaker {
    key: String,
    shared: Arc<BreakerShared>,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

/// Admission to run one guarded call. Must be consumed with [`record`].
///
/// Dropping an unconsumed permit releases any half-open slot without
/// counting an outcome.
///
/// [`record`]: BreakerPermit::record
#[must_use = "record the call outcome on the permit"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    half_open: bool,
    consumed: bool,
}

impl CircuitBreaker {
    pub fn new(key: impl Into<String>, config: BreakerConfig, events: EventBus) -> Self {
        let open_duration_millis = config.open_duration.as_millis() as u64;
        Self {
            key: key.into(),
            shared: Arc::new(BreakerShared {
                state: AtomicU8::new(STATE_CLOSED),
                consecutive_failures: AtomicUsize::new(0),
                half_open_calls: AtomicUsize::new(0),
                half_open_successes: AtomicUsize::new(0),
                opened_at_millis: AtomicU64::new(0),
                open_duration_millis: AtomicU64::new(open_duration_millis),
            }),
            config,
            clock: Arc::new(MonotonicClock::default()),
            events,
        }
    }

    /// Override the clock (useful for deterministic tests)
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_raw(self.shared.state.load(Ordering::Acquire))
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state();
        let open_for = (state != CircuitState::Closed).then(|| {
            Duration::from_millis(
                self.clock
                    .now_millis()
                    .saturating_sub(self.shared.opened_at_millis.load(Ordering::Acquire)),
            )
        });
        BreakerSnapshot {
            key: self.key.clone(),
            state,
            consecutive_failures: self.shared.consecutive_failures.load(Ordering::Acquire),
            open_duration: Duration::from_millis(
                self.shared.open_duration_millis.load(Ordering::Acquire),
            ),
            open_for,
        }
    }

    /// Force the breaker back to Closed, clearing all counters. Admin-only.
    pub fn reset(&self) {
        self.shared.state.store(STATE_CLOSED, Ordering::Release);
        self.shared.consecutive_failures.store(0, Ordering::Release);
        self.shared.half_open_calls.store(0, Ordering::Release);
        self.shared.half_open_successes.store(0, Ordering::Release);
        self.shared
            .open_duration_millis
            .store(self.config.open_duration.as_millis() as u64, Ordering::Release);
    }

    /// Ask to run one guarded call.
    ///
    /// Returns `CircuitOpen` (with the time until the next probe window) when
    /// the breaker is open, or when the half-open concurrency cap is reached.
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>, CoreError> {
        loop {
            match self.shared.state.load(Ordering::Acquire) {
                STATE_CLOSED => {
                    return Ok(BreakerPermit { breaker: self, half_open: false, consumed: false })
                }
                STATE_OPEN => {
                    let opened_at = self.shared.opened_at_millis.load(Ordering::Acquire);
                    let window = self.shared.open_duration_millis.load(Ordering::Acquire);
                    let elapsed = self.clock.now_millis().saturating_sub(opened_at);

                    if elapsed < window {
                        return Err(CoreError::CircuitOpen {
                            key: self.key.clone(),
                            retry_after: Duration::from_millis(window - elapsed),
                        });
                    }

                    match self.shared.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            // We won the race: first probe of this window.
                            self.shared.half_open_calls.store(1, Ordering::Release);
                            self.shared.half_open_successes.store(0, Ordering::Release);
                            self.emit_transition(
                                CircuitState::Open,
                                CircuitState::HalfOpen,
                                BreakerReason::ProbeWindow,
                            );
                            return Ok(BreakerPermit {
                                breaker: self,
                                half_open: true,
                                consumed: false,
                            });
                        }
                        // Someone else moved it; re-evaluate.
                        Err(_) => continue,
                    }
                }
                _ => {
                    let in_flight = self.shared.half_open_calls.fetch_add(1, Ordering::AcqRel);
                    if in_flight >= self.config.half_open_max_concurrency {
                        self.shared.half_open_calls.fetch_sub(1, Ordering::Release);
                        return Err(CoreError::CircuitOpen {
                            key: self.key.clone(),
                            retry_after: Duration::ZERO,
                        });
                    }
                    return Ok(BreakerPermit { breaker: self, half_open: true, consumed: false });
                }
            }
        }
    }

    /// Run `operation` behind the breaker, recording its outcome.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, CoreError>
    where
        T: Send,
        Fut: Future<Output = Result<T, CoreError>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let permit = self.try_acquire()?;
        let result = operation().await;
        permit.record(result.is_ok());
        result
    }

    fn on_success(&self, half_open: bool) {
        if half_open {
            self.shared.half_open_calls.fetch_sub(1, Ordering::Release);
            let successes = self.shared.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
            if successes >= self.config.success_threshold
                && self
                    .shared
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_CLOSED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
            {
                self.shared.consecutive_failures.store(0, Ordering::Release);
                // Full recovery resets the escalated window.
                self.shared
                    .open_duration_millis
                    .store(self.config.open_duration.as_millis() as u64, Ordering::Release);
                tracing::info!(key = %self.key, "circuit breaker closed");
                self.emit_transition(
                    CircuitState::HalfOpen,
                    CircuitState::Closed,
                    BreakerReason::ProbeSuccess,
                );
            }
        } else if self.shared.state.load(Ordering::Acquire) == STATE_CLOSED {
            self.shared.consecutive_failures.store(0, Ordering::Release);
        }
    }

    fn on_failure(&self, half_open: bool) {
        let failures = self.shared.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;

        if half_open {
            self.shared.half_open_calls.fetch_sub(1, Ordering::Release);
            if self
                .shared
                .state
                .compare_exchange(
                    STATE_HALF_OPEN,
                    STATE_OPEN,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                self.escalate_open_window();
                self.shared.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                tracing::warn!(key = %self.key, failures, "probe failed, circuit breaker reopened");
                self.emit_transition(
                    CircuitState::HalfOpen,
                    CircuitState::Open,
                    BreakerReason::ProbeFailure,
                );
            }
        } else if failures >= self.config.failure_threshold
            && self
                .shared
                .state
                .compare_exchange(STATE_CLOSED, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.shared.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
            tracing::error!(
                key = %self.key,
                failures,
                threshold = self.config.failure_threshold,
                "circuit breaker opened"
            );
            self.emit_transition(
                CircuitState::Closed,
                CircuitState::Open,
                BreakerReason::FailureThreshold,
            );
        }
    }

    fn escalate_open_window(&self) {
        let cap = self.config.open_duration_cap.as_millis() as u64;
        let current = self.shared.open_duration_millis.load(Ordering::Acquire);
        let next =
            ((current as f64 * self.config.open_backoff_factor) as u64).min(cap).max(current);
        self.shared.open_duration_millis.store(next, Ordering::Release);
    }

    fn emit_transition(&self, from: CircuitState, to: CircuitState, reason: BreakerReason) {
        self.events.emit(CoreEvent::Breaker(BreakerEvent {
            key: self.key.clone(),
            from,
            to,
            reason,
            failure_count: self.shared.consecutive_failures.load(Ordering::Acquire),
        }));
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}

impl BreakerPermit<'_> {
    /// Record the call outcome, driving any state transition.
    pub fn record(mut self, success: bool) {
        self.consumed = true;
        if success {
            self.breaker.on_success(self.half_open);
        } else {
            self.breaker.on_failure(self.half_open);
        }
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.consumed && self.half_open {
            self.breaker.shared.half_open_calls.fetch_sub(1, Ordering::Release);
        }
    }
}
