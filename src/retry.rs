//! Retry harness
//!
//! Wraps a fallible async operation with bounded retries, exponential backoff
//! plus jitter, and cooperative cancellation. Only errors the taxonomy marks
//! retryable are re-run; fatal errors return immediately.

use crate::config::{ConfigError, RetryConfig};
use crate::error::CoreError;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{CoreEvent, EventBus, RetryEvent};
use crate::{Backoff, Jitter};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    sleeper: Arc<dyn Sleeper>,
    events: EventBus,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .finish()
    }
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// Policy configured from the frozen retry table. A zero attempt count
    /// is rejected by config validation; clamp here so an unvalidated table
    /// cannot produce a policy that never runs its operation.
    pub fn from_config(config: &RetryConfig, events: EventBus) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: Backoff::exponential(config.base_delay, config.multiplier, config.max_delay),
            jitter: Jitter::uniform(config.jitter_max),
            sleeper: Arc::new(TokioSleeper),
            events,
        }
    }

    /// Run `operation` until it succeeds, fails fatally, is cancelled, or the
    /// attempt budget runs out.
    ///
    /// Exhaustion returns `RetriesExhausted` wrapping the last error together
    /// with the accumulated attempt count. Cancellation short-circuits any
    /// pending backoff sleep and returns `Cancelled`.
    pub async fn execute<T, Fut, Op>(
        &self,
        cancel: &CancellationToken,
        mut operation: Op,
    ) -> Result<T, CoreError>
    where
        T: Send,
        Fut: Future<Output = Result<T, CoreError>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        for attempt in 1..=self.max_attempts {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }

            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    if attempt >= self.max_attempts {
                        self.events.emit(CoreEvent::Retry(RetryEvent::Exhausted {
                            attempts: self.max_attempts,
                        }));
                        return Err(CoreError::RetriesExhausted {
                            attempts: self.max_attempts,
                            last: Box::new(e),
                        });
                    }

                    let delay = self.jitter.apply(self.backoff.delay(attempt));
                    tracing::debug!(attempt, ?delay, error = %e, "retrying after backoff");
                    self.events
                        .emit(CoreEvent::Retry(RetryEvent::Attempt { attempt, delay }));

                    tokio::select! {
                        _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                        _ = self.sleeper.sleep(delay) => {}
                    }
                }
            }
        }

        // The loop always returns from its final iteration.
        unreachable!("retry loop exited without a result")
    }
}

pub struct RetryPolicyBuilder {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    sleeper: Arc<dyn Sleeper>,
    events: EventBus,
}

impl RetryPolicyBuilder {
    pub fn new() -> Self {
        let defaults = RetryConfig::default();
        Self {
            max_attempts: defaults.max_attempts,
            backoff: Backoff::exponential(
                defaults.base_delay,
                defaults.multiplier,
                defaults.max_delay,
            ),
            jitter: Jitter::uniform(defaults.jitter_max),
            sleeper: Arc::new(TokioSleeper),
            events: EventBus::disabled(),
        }
    }

    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn build(self) -> Result<RetryPolicy, ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::ZeroMaxAttempts);
        }
        Ok(RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            jitter: self.jitter,
            sleeper: self.sleeper,
            events: self.events,
        })
    }
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sleeper::{InstantSleeper, TrackingSleeper};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn transport(detail: &str) -> CoreError {
        CoreError::Transport { detail: detail.into() }
    }

    fn policy(max_attempts: usize) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(max_attempts)
            .backoff(Backoff::constant(Duration::from_millis(10)))
            .with_jitter(Jitter::None)
            .with_sleeper(InstantSleeper)
            .build()
            .expect("valid policy")
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let result = policy(3)
            .execute(&CancellationToken::new(), || {
                let counter = counter_clone.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, CoreError>(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transport_errors_until_success() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let result = policy(5)
            .execute(&CancellationToken::new(), || {
                let counter = counter_clone.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(transport("flaky"))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_wraps_the_last_error() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let result = policy(3)
            .execute(&CancellationToken::new(), || {
                let counter = counter_clone.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(transport(&format!("attempt {n}")))
                }
            })
            .await;

        assert_eq!(counter.load(Ordering::SeqCst), 3);
        match result.unwrap_err() {
            CoreError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert_eq!(*last, transport("attempt 2"));
            }
            e => panic!("expected RetriesExhausted, got {e:?}"),
        }
    }

    #[tokio::test]
    async fn fatal_errors_short_circuit() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let result = policy(5)
            .execute(&CancellationToken::new(), || {
                let counter = counter_clone.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(CoreError::Protocol { detail: "bad schema".into() })
                }
            })
            .await;

        assert!(result.unwrap_err().is_protocol());
        assert_eq!(counter.load(Ordering::SeqCst), 1, "fatal errors are not retried");
    }

    #[tokio::test]
    async fn circuit_open_is_not_retried_by_the_harness() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let result = policy(5)
            .execute(&CancellationToken::new(), || {
                let counter = counter_clone.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(CoreError::CircuitOpen {
                        key: "nga:nga-0".into(),
                        retry_after: Duration::from_secs(1),
                    })
                }
            })
            .await;

        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn backoff_delays_follow_the_schedule() {
        let sleeper = TrackingSleeper::new();
        let policy = RetryPolicy::builder()
            .max_attempts(4)
            .backoff(Backoff::exponential(
                Duration::from_millis(100),
                2.0,
                Duration::from_secs(5),
            ))
            .with_jitter(Jitter::None)
            .with_sleeper(sleeper.clone())
            .build()
            .expect("valid policy");

        let _ = policy
            .execute(&CancellationToken::new(), || async {
                Err::<(), _>(transport("always"))
            })
            .await;

        assert_eq!(
            sleeper.calls(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
            ],
            "three sleeps between four attempts"
        );
    }

    #[tokio::test]
    async fn cancellation_short_circuits_the_sleep() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        let result = policy(3)
            .execute(&cancel, || {
                let counter = counter_clone.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, CoreError>(1)
                }
            })
            .await;

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(counter.load(Ordering::SeqCst), 0, "pre-cancelled tokens skip the call");
    }

    #[tokio::test]
    async fn cancellation_mid_backoff_returns_promptly() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::builder()
            .max_attempts(3)
            .backoff(Backoff::constant(Duration::from_secs(60)))
            .with_jitter(Jitter::None)
            .build()
            .expect("valid policy");

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let start = std::time::Instant::now();
        let result = policy
            .execute(&cancel, || async { Err::<(), _>(transport("down")) })
            .await;

        assert!(result.unwrap_err().is_cancelled());
        assert!(start.elapsed() < Duration::from_secs(5), "must not ride out the full backoff");
    }

    #[test]
    fn zero_attempts_is_a_build_error() {
        assert!(RetryPolicy::builder().max_attempts(0).build().is_err());
    }
}
