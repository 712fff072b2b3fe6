//! Convenient re-exports for common Turnloom types.
pub use crate::{
    telemetry::{
        CoreEvent, EventBus, LogSink, MemorySink, MulticastSink, NullSink, TelemetrySink,
    },
    AgentConnector, AgentId, AgentKind, AgentRegistry, AgentStatus, AgentTransport, Backoff,
    BreakerConfig, BreakerRegistry, CircuitBreaker, CircuitState, Clock, ConfigError,
    ConnectorTransport, CoreConfig, CoreError, Envelope, HealthMonitor, HealthSnapshot,
    InMemoryQueue, Jitter, MessageCoordinator, MessageKind, MessageQueue, MockTransport,
    MonotonicClock, NackDisposition, Orchestrator, Priority, QueueConfig, RetryPolicy,
    SafetyGate, SafetyPolicy, SafetyVerdict, Sleeper, Stage, TokioSleeper, TurnResult,
    TurnStats, TurnStatus, WorkflowManager,
};
