//! The assembled core: one façade wiring queue, registry, coordinator,
//! workflow, safety, and health into the surface the front-end consumes.
//!
//! Built once at startup from a frozen config, started, and shut down as a
//! unit. All background tasks are owned and joined on shutdown.

use crate::bridge::AgentTransport;
use crate::config::{ConfigError, CoreConfig};
use crate::coordinator::MessageCoordinator;
use crate::envelope::{AgentId, AgentKind, Envelope};
use crate::error::CoreError;
use crate::health::{HealthMonitor, HealthSnapshot, TurnStats};
use crate::memory_queue::InMemoryQueue;
use crate::queue::MessageQueue;
use crate::registry::AgentRegistry;
use crate::safety::{AllowAllPolicy, SafetyGate, SafetyPolicy};
use crate::telemetry::{EventBus, TelemetrySink};
use crate::workflow::{TurnResult, WorkflowManager};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Agent kinds the coordinator services by default: the narrative pipeline
/// plus the auxiliary worker kinds.
pub const SERVICED_KINDS: [AgentKind; 4] =
    [AgentKind::Ipa, AgentKind::Wba, AgentKind::Nga, AgentKind::OpenHands];

/// Failures assembling an [`Orchestrator`].
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("an agent transport is required")]
    MissingTransport,
}

/// Builder for the assembled core.
pub struct OrchestratorBuilder {
    config: CoreConfig,
    queue: Option<Arc<dyn MessageQueue>>,
    transport: Option<Arc<dyn AgentTransport>>,
    policy: Arc<dyn SafetyPolicy>,
    events: EventBus,
    events_handle: Option<JoinHandle<()>>,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            config: CoreConfig::default(),
            queue: None,
            transport: None,
            policy: Arc::new(AllowAllPolicy),
            events: EventBus::disabled(),
            events_handle: None,
        }
    }

    pub fn config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Queue backend; defaults to [`InMemoryQueue`]. Pass the Redis-backed
    /// queue from `turnloom-redis` in production.
    pub fn queue(mut self, queue: Arc<dyn MessageQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// The agent transport. Required.
    pub fn transport(mut self, transport: Arc<dyn AgentTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn safety_policy(mut self, policy: Arc<dyn SafetyPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Route core events into `sink` through a non-blocking bus. The drain
    /// worker is owned by the orchestrator and joined on shutdown.
    pub fn telemetry<S>(mut self, sink: S) -> Self
    where
        S: TelemetrySink,
        S::Future: Send + 'static,
    {
        let (events, handle) = EventBus::spawn(sink);
        self.events = events;
        self.events_handle = Some(handle);
        self
    }

    pub fn build(self) -> Result<Orchestrator, BuildError> {
        self.config.validate()?;
        let transport = self.transport.ok_or(BuildError::MissingTransport)?;
        let events = self.events;
        let queue = self
            .queue
            .unwrap_or_else(|| Arc::new(InMemoryQueue::new(self.config.queue.clone(), events.clone())));

        let registry =
            Arc::new(AgentRegistry::new(self.config.registry.clone(), events.clone()));
        let coordinator = Arc::new(MessageCoordinator::new(
            queue.clone(),
            registry.clone(),
            transport,
            &self.config,
            events.clone(),
        ));
        let stats = Arc::new(TurnStats::new(self.config.health.latency_window));
        let workflow = WorkflowManager::new(
            coordinator.clone(),
            SafetyGate::new(self.policy, self.config.safety.clone()),
            &self.config,
            events.clone(),
        )
        .with_turn_stats(stats.clone());
        let health = HealthMonitor::new(
            registry.clone(),
            coordinator.breakers(),
            queue.clone(),
            stats,
            self.config.health.clone(),
            events,
        );

        Ok(Orchestrator {
            config: self.config,
            queue,
            registry,
            coordinator,
            workflow,
            health,
            events_handle: self.events_handle,
        })
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The assembled orchestration core.
pub struct Orchestrator {
    config: CoreConfig,
    queue: Arc<dyn MessageQueue>,
    registry: Arc<AgentRegistry>,
    coordinator: Arc<MessageCoordinator>,
    workflow: WorkflowManager,
    health: Arc<HealthMonitor>,
    events_handle: Option<JoinHandle<()>>,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// Start the coordinator worker pools and the health reporter.
    pub fn start(&self) {
        self.coordinator.start(&SERVICED_KINDS);
        self.health.start();
    }

    /// Run one user turn with the configured default deadline.
    pub async fn run_turn(
        &self,
        session_id: &str,
        input: impl Into<Vec<u8>>,
        cancel: &CancellationToken,
    ) -> TurnResult {
        self.workflow.run_turn(session_id, input, cancel).await
    }

    /// Run one user turn bounded by `deadline`.
    pub async fn run_turn_with_deadline(
        &self,
        session_id: &str,
        input: impl Into<Vec<u8>>,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> TurnResult {
        self.workflow.run_turn_with_deadline(session_id, input, deadline, cancel).await
    }

    /// Make an agent instance known to the registry. It starts taking
    /// traffic after its first heartbeat.
    pub fn register_agent(&self, identity: AgentId, capabilities: HashSet<String>) {
        self.registry.register(identity, capabilities);
    }

    /// Liveness signal from an agent instance.
    pub fn report_heartbeat(&self, identity: &AgentId) -> Result<(), CoreError> {
        self.registry.heartbeat(identity)
    }

    pub fn deregister_agent(&self, identity: &AgentId) {
        self.registry.deregister(identity);
    }

    /// Read-only aggregate of agents, breakers, queues, and turn stats.
    pub async fn admin_snapshot(&self) -> HealthSnapshot {
        self.health.snapshot().await
    }

    /// Remove and return every dead-lettered envelope for `kind`.
    pub async fn admin_drain_dlq(&self, kind: AgentKind) -> Result<Vec<Envelope>, CoreError> {
        self.queue.drain_dead_letters(kind).await
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Stop every owned task and join them: coordinator workers, the health
    /// reporter, and the telemetry drain.
    pub async fn shutdown(self) {
        self.coordinator.shutdown().await;
        self.health.shutdown().await;

        // Drop every component holding an event-bus clone so the drain
        // worker's channel closes, then join it.
        let Orchestrator {
            config: _,
            queue,
            registry,
            coordinator,
            workflow,
            health,
            events_handle,
        } = self;
        drop(workflow);
        drop(health);
        drop(coordinator);
        drop(registry);
        drop(queue);
        if let Some(handle) = events_handle {
            let _ = handle.await;
        }
    }
}
