//! Immutable configuration for the orchestration core.
//!
//! Config is constructed once at startup, validated, and passed by reference;
//! hot changes require restarting the owning component.

use crate::envelope::Stage;
use std::time::Duration;

/// Validation failures for core configuration.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("retry base_delay must be > 0")]
    ZeroBaseDelay,
    #[error("retry multiplier must be >= 1.0 (got {0})")]
    BadMultiplier(f64),
    #[error("retry max_attempts must be > 0")]
    ZeroMaxAttempts,
    #[error("breaker failure_threshold must be > 0")]
    ZeroFailureThreshold,
    #[error("breaker success_threshold must be > 0")]
    ZeroSuccessThreshold,
    #[error("breaker open_duration must be > 0")]
    ZeroOpenDuration,
    #[error("breaker open_backoff_factor must be >= 1.0 (got {0})")]
    BadOpenBackoff(f64),
    #[error("queue max_depth must be > 0")]
    ZeroMaxDepth,
    #[error("queue reservation_ttl must be > 0")]
    ZeroReservationTtl,
    #[error("registry thresholds must satisfy degraded < unhealthy")]
    BadHealthThresholds,
    #[error("workflow turn_deadline must be > 0")]
    ZeroTurnDeadline,
    #[error("stage weight for {0:?} must be positive and finite (got {1})")]
    BadStageWeight(Stage, f64),
}

/// Retry harness tunables.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter_max: Duration,
    pub max_attempts: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter_max: Duration::from_millis(50),
            max_attempts: 4,
        }
    }
}

/// Circuit breaker tunables, shared by every breaker key.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: usize,
    pub success_threshold: usize,
    pub open_duration: Duration,
    pub open_duration_cap: Duration,
    pub open_backoff_factor: f64,
    pub half_open_max_concurrency: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration: Duration::from_secs(30),
            open_duration_cap: Duration::from_secs(300),
            open_backoff_factor: 2.0,
            half_open_max_concurrency: 1,
        }
    }
}

/// Queue tunables.
///
/// `max_delivery_attempts` bounds redeliveries (tail nacks and reclaimed
/// reservations both count) before an envelope is dead-lettered.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub reservation_ttl: Duration,
    pub max_depth: usize,
    pub enqueue_wait: Duration,
    pub max_delivery_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            reservation_ttl: Duration::from_secs(30),
            max_depth: 10_000,
            enqueue_wait: Duration::from_millis(500),
            max_delivery_attempts: 4,
        }
    }
}

/// Agent registry tunables.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub heartbeat_period: Duration,
    pub degraded_threshold: Duration,
    pub unhealthy_threshold: Duration,
    pub eviction_grace: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_period: Duration::from_secs(5),
            degraded_threshold: Duration::from_secs(15),
            unhealthy_threshold: Duration::from_secs(45),
            eviction_grace: Duration::from_secs(120),
        }
    }
}

/// Coordinator worker-pool tunables.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Workers servicing each agent kind's queue.
    pub workers_per_kind: usize,
    /// Idle delay between empty reserve attempts.
    pub poll_interval: Duration,
    /// Cadence of the expired-reservation sweep.
    pub reclaim_interval: Duration,
    /// Global cap on concurrent dispatches across all kinds and sessions.
    pub max_concurrent_dispatches: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            workers_per_kind: 2,
            poll_interval: Duration::from_millis(25),
            reclaim_interval: Duration::from_secs(1),
            max_concurrent_dispatches: 64,
        }
    }
}

/// Workflow tunables. Stage weights split the turn deadline across
/// PreSafety, Ipa, Wba, Nga, PostSafety, in that order.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    pub turn_deadline: Duration,
    pub stage_weights: [f64; 5],
}

impl WorkflowConfig {
    pub const STAGES: [Stage; 5] =
        [Stage::PreSafety, Stage::Ipa, Stage::Wba, Stage::Nga, Stage::PostSafety];

    /// Weight assigned to a pipeline stage; zero for terminal stages.
    pub fn weight(&self, stage: Stage) -> f64 {
        Self::STAGES
            .iter()
            .position(|s| *s == stage)
            .map(|i| self.stage_weights[i])
            .unwrap_or(0.0)
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            turn_deadline: Duration::from_secs(30),
            stage_weights: [0.05, 0.30, 0.25, 0.35, 0.05],
        }
    }
}

/// How the safety gate treats a policy timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyFailMode {
    /// Timeout blocks the content (default).
    FailClosed,
    /// Timeout allows the content through. Explicit operator decision.
    FailOpen,
}

/// Safety gate tunables.
#[derive(Debug, Clone)]
pub struct SafetyConfig {
    pub policy_timeout: Duration,
    pub fail_mode: SafetyFailMode,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self { policy_timeout: Duration::from_secs(2), fail_mode: SafetyFailMode::FailClosed }
    }
}

/// Health monitor tunables. The monitor observes; it never acts.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub tick_interval: Duration,
    /// Alert when the oldest queued envelope exceeds this age.
    pub max_oldest_age: Duration,
    /// Alert when a breaker has been open longer than this.
    pub max_breaker_open: Duration,
    /// Alert when a dead-letter queue grows past this depth.
    pub max_dlq_depth: usize,
    /// Bounded window of stage latency samples kept for percentiles.
    pub latency_window: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            max_oldest_age: Duration::from_secs(30),
            max_breaker_open: Duration::from_secs(300),
            max_dlq_depth: 100,
            latency_window: 512,
        }
    }
}

/// Aggregate, frozen configuration for the whole core.
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub queue: QueueConfig,
    pub registry: RegistryConfig,
    pub coordinator: CoordinatorConfig,
    pub workflow: WorkflowConfig,
    pub safety: SafetyConfig,
    pub health: HealthConfig,
}

impl CoreConfig {
    /// Validate the whole table. Misconfiguration is fatal at startup,
    /// never discovered mid-turn.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.base_delay.is_zero() {
            return Err(ConfigError::ZeroBaseDelay);
        }
        if self.retry.multiplier < 1.0 || !self.retry.multiplier.is_finite() {
            return Err(ConfigError::BadMultiplier(self.retry.multiplier));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ZeroMaxAttempts);
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::ZeroFailureThreshold);
        }
        if self.breaker.success_threshold == 0 {
            return Err(ConfigError::ZeroSuccessThreshold);
        }
        if self.breaker.open_duration.is_zero() {
            return Err(ConfigError::ZeroOpenDuration);
        }
        if self.breaker.open_backoff_factor < 1.0 || !self.breaker.open_backoff_factor.is_finite()
        {
            return Err(ConfigError::BadOpenBackoff(self.breaker.open_backoff_factor));
        }
        if self.queue.max_depth == 0 {
            return Err(ConfigError::ZeroMaxDepth);
        }
        if self.queue.reservation_ttl.is_zero() {
            return Err(ConfigError::ZeroReservationTtl);
        }
        if self.registry.degraded_threshold >= self.registry.unhealthy_threshold {
            return Err(ConfigError::BadHealthThresholds);
        }
        if self.workflow.turn_deadline.is_zero() {
            return Err(ConfigError::ZeroTurnDeadline);
        }
        for (stage, weight) in WorkflowConfig::STAGES.iter().zip(self.workflow.stage_weights) {
            if weight <= 0.0 || !weight.is_finite() {
                return Err(ConfigError::BadStageWeight(*stage, weight));
            }
        }
        Ok(())
    }
}
