#![forbid(unsafe_code)]

//! # Turnloom
//!
//! Agent orchestration core for turn-based interactive narrative. One user
//! turn flows through a pipeline of cooperating agents (input processing →
//! world building → narrative generation) with safety checks on both ends,
//! queue-mediated delivery, per-agent circuit breakers, and heartbeat-driven
//! liveness.
//!
//! ## Features
//!
//! - **Workflow manager** driving turns through the staged pipeline with
//!   weighted deadline budgets and cooperative cancellation
//! - **Message coordinator**: per-kind worker pools, per-session
//!   serialization, reply correlation, dead-lettering
//! - **Prioritized queues** with reservations and at-least-once redelivery
//!   (in-memory here; Redis via the `turnloom-redis` crate)
//! - **Circuit breakers** with half-open probes and escalating open windows,
//!   lock-free via atomics
//! - **Agent registry** with heartbeat-derived health and round-robin lookup
//! - **Safety gate** wrapping an external policy, fail-closed by default
//! - **Health monitor** aggregating all of the above into one snapshot
//!
//! ## Quick Start
//!
//! ```rust
//! use std::collections::HashSet;
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//! use turnloom::{AgentId, AgentKind, MockTransport, Orchestrator, TurnStatus};
//!
//! #[tokio::main]
//! async fn main() {
//!     // Scripted backends; swap in real connectors in production.
//!     let transport = Arc::new(MockTransport::new());
//!     transport.static_reply(AgentKind::Ipa, "ipa-ok");
//!     transport.static_reply(AgentKind::Wba, "wba-ok");
//!     transport.static_reply(AgentKind::Nga, "nga-ok");
//!
//!     let orchestrator = Orchestrator::builder()
//!         .transport(transport)
//!         .build()
//!         .expect("valid assembly");
//!     orchestrator.start();
//!
//!     for kind in [AgentKind::Ipa, AgentKind::Wba, AgentKind::Nga] {
//!         let id = AgentId::new(kind, "0");
//!         orchestrator.register_agent(id.clone(), HashSet::new());
//!         orchestrator.report_heartbeat(&id).expect("registered");
//!     }
//!
//!     let result = orchestrator
//!         .run_turn_with_deadline(
//!             "session-1",
//!             "hello",
//!             Duration::from_secs(5),
//!             &CancellationToken::new(),
//!         )
//!         .await;
//!     assert_eq!(result.terminal_status, TurnStatus::Done);
//!
//!     orchestrator.shutdown().await;
//! }
//! ```

mod backoff;
mod breaker;
mod breaker_registry;
mod bridge;
mod clock;
mod config;
mod coordinator;
mod envelope;
mod error;
mod health;
mod jitter;
mod memory_queue;
mod orchestrator;
mod queue;
mod registry;
mod retry;
mod safety;
mod sleeper;
mod workflow;

pub mod telemetry;

// Re-exports
pub use backoff::Backoff;
pub use breaker::{BreakerPermit, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use breaker_registry::BreakerRegistry;
pub use bridge::{AgentConnector, AgentTransport, ConnectorTransport, MockTransport};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{
    BreakerConfig, ConfigError, CoordinatorConfig, CoreConfig, HealthConfig, QueueConfig,
    RegistryConfig, RetryConfig, SafetyConfig, SafetyFailMode, WorkflowConfig,
};
pub use coordinator::{MessageCoordinator, ReplyWaiter};
pub use envelope::{
    AgentId, AgentKind, Envelope, MessageKind, Priority, Stage, FORMAT_VERSION, MAX_PAYLOAD_BYTES,
};
pub use error::CoreError;
pub use health::{
    HealthMonitor, HealthSnapshot, QueueHealth, StageLatencySummary, TurnStats,
    TurnStatsSnapshot,
};
pub use jitter::Jitter;
pub use memory_queue::InMemoryQueue;
pub use orchestrator::{BuildError, Orchestrator, OrchestratorBuilder, SERVICED_KINDS};
pub use queue::{MessageQueue, NackDisposition, QueueDepths};
pub use registry::{AgentRecord, AgentRegistry, AgentStatus};
pub use retry::{RetryPolicy, RetryPolicyBuilder};
pub use safety::{AllowAllPolicy, SafetyGate, SafetyPolicy, SafetyRequest, SafetyVerdict};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use telemetry::EventBus;
pub use workflow::{Artefact, TurnError, TurnResult, TurnStatus, WorkflowManager};

pub mod prelude;
