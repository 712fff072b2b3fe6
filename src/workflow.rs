//! Workflow manager: drives one user turn through the agent pipeline.
//!
//! ```text
//! PreSafety ─ok→ Ipa ─ok→ Wba ─ok→ Nga ─ok→ PostSafety ─ok→ Done
//!      │          │         │        │            │
//!      └─fail─────┴─fail────┴─fail───┴─fail───────┴──→ Failed
//! ```
//!
//! The turn deadline is split across stages by the configured weight vector;
//! unspent budget rolls forward. A stage that fails with `CircuitOpen` or a
//! transport error is retried once with a fresh envelope if its budget
//! allows; every other failure terminates the turn. Cancellation terminates
//! immediately and abandons any in-flight waiter (the late reply is
//! dead-lettered by the coordinator).

use crate::clock::{Clock, MonotonicClock};
use crate::config::{CoreConfig, WorkflowConfig};
use crate::coordinator::MessageCoordinator;
use crate::envelope::{AgentId, AgentKind, Envelope, MessageKind, Priority, Stage};
use crate::error::CoreError;
use crate::health::TurnStats;
use crate::safety::{SafetyGate, SafetyVerdict};
use crate::telemetry::{CoreEvent, EventBus, TurnEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    Done,
    Failed,
    Cancelled,
}

/// User-facing failure: a stable code and a human-safe message, never
/// internal identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnError {
    pub code: &'static str,
    pub message: String,
    pub stage: Option<Stage>,
}

/// One stage's output.
#[derive(Debug, Clone, PartialEq)]
pub struct Artefact {
    pub stage: Stage,
    pub payload: Vec<u8>,
}

/// The front-end's view of a finished turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnResult {
    pub turn_id: Uuid,
    pub artefacts: Vec<Artefact>,
    pub stage_latencies: Vec<(Stage, Duration)>,
    pub terminal_status: TurnStatus,
    pub error: Option<TurnError>,
}

/// Mutable state of one in-flight turn. Owned exclusively by its
/// `run_turn` invocation.
struct TurnContext {
    turn_id: Uuid,
    session_id: String,
    stage: Stage,
    artefacts: Vec<Artefact>,
    stage_latencies: Vec<(Stage, Duration)>,
}

/// Drives user turns through PreSafety → Ipa → Wba → Nga → PostSafety.
pub struct WorkflowManager {
    coordinator: Arc<MessageCoordinator>,
    safety: SafetyGate,
    config: WorkflowConfig,
    clock: Arc<dyn Clock>,
    events: EventBus,
    stats: Option<Arc<TurnStats>>,
    origin: AgentId,
}

impl WorkflowManager {
    pub fn new(
        coordinator: Arc<MessageCoordinator>,
        safety: SafetyGate,
        config: &CoreConfig,
        events: EventBus,
    ) -> Self {
        Self {
            coordinator,
            safety,
            config: config.workflow.clone(),
            clock: Arc::new(MonotonicClock::default()),
            events,
            stats: None,
            origin: AgentId::new(AgentKind::External, "workflow"),
        }
    }

    /// Share turn statistics with the health monitor.
    pub fn with_turn_stats(mut self, stats: Arc<TurnStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Run one turn with the configured default deadline.
    pub async fn run_turn(
        &self,
        session_id: &str,
        input: impl Into<Vec<u8>>,
        cancel: &CancellationToken,
    ) -> TurnResult {
        self.run_turn_with_deadline(session_id, input, self.config.turn_deadline, cancel).await
    }

    /// Run one turn bounded by `deadline`.
    pub async fn run_turn_with_deadline(
        &self,
        session_id: &str,
        input: impl Into<Vec<u8>>,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> TurnResult {
        let mut ctx = TurnContext {
            turn_id: Uuid::new_v4(),
            session_id: session_id.to_string(),
            stage: Stage::PreSafety,
            artefacts: Vec::new(),
            stage_latencies: Vec::new(),
        };
        let turn_start = self.clock.now_millis();
        let mut payload = input.into();
        let mut rollover = Duration::ZERO;

        tracing::info!(turn_id = %ctx.turn_id, session_id, "turn started");

        for stage in WorkflowConfig::STAGES {
            ctx.stage = stage;
            let elapsed = Duration::from_millis(
                self.clock.now_millis().saturating_sub(turn_start),
            );
            let remaining_turn = deadline.saturating_sub(elapsed);
            if remaining_turn.is_zero() {
                return self.fail(ctx, CoreError::DeadlineExceeded { stage: Some(stage) });
            }
            let budget =
                (deadline.mul_f64(self.config.weight(stage)) + rollover).min(remaining_turn);

            let stage_start = self.clock.now_millis();
            let outcome = match stage {
                Stage::PreSafety | Stage::PostSafety => {
                    match self.safety.check(session_id, stage, &payload, cancel).await {
                        Ok(SafetyVerdict::Allow) => Ok(None),
                        Ok(SafetyVerdict::Rewrite(replacement)) => Ok(Some(replacement)),
                        Ok(SafetyVerdict::Block { reason }) => {
                            Err(CoreError::SafetyBlocked { reason })
                        }
                        Err(e) => Err(e),
                    }
                }
                _ => {
                    let kind = stage.agent_kind().unwrap_or(AgentKind::External);
                    self.run_stage(&ctx, stage, kind, &payload, budget, cancel).await.map(Some)
                }
            };
            let spent =
                Duration::from_millis(self.clock.now_millis().saturating_sub(stage_start));
            ctx.stage_latencies.push((stage, spent));

            match outcome {
                Ok(replacement) => {
                    if let Some(replacement) = replacement {
                        if stage == Stage::PostSafety {
                            // Post-safety rewrite replaces the final narrative.
                            if let Some(last) = ctx.artefacts.last_mut() {
                                last.payload = replacement.clone();
                            }
                        } else if stage.agent_kind().is_some() {
                            ctx.artefacts
                                .push(Artefact { stage, payload: replacement.clone() });
                        }
                        payload = replacement;
                    }
                    rollover = budget.saturating_sub(spent);
                    self.events
                        .emit(CoreEvent::Turn(TurnEvent::StageCompleted { stage, latency: spent }));
                }
                Err(e) => return self.fail(ctx, e),
            }
        }

        ctx.stage = Stage::Done;
        let total = Duration::from_millis(self.clock.now_millis().saturating_sub(turn_start));
        tracing::info!(turn_id = %ctx.turn_id, ?total, "turn done");
        self.events.emit(CoreEvent::Turn(TurnEvent::Completed {
            session_id: ctx.session_id.clone(),
            total,
        }));
        if let Some(stats) = &self.stats {
            stats.record(TurnStatus::Done, &ctx.stage_latencies);
        }
        TurnResult {
            turn_id: ctx.turn_id,
            artefacts: ctx.artefacts,
            stage_latencies: ctx.stage_latencies,
            terminal_status: TurnStatus::Done,
            error: None,
        }
    }

    /// Dispatch one pipeline stage, retrying once on breaker or transport
    /// failure while the stage budget allows.
    async fn run_stage(
        &self,
        ctx: &TurnContext,
        stage: Stage,
        kind: AgentKind,
        payload: &[u8],
        budget: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, CoreError> {
        let stage_start = self.clock.now_millis();
        match self.dispatch_once(ctx, kind, payload, budget, cancel).await {
            Ok(reply) => Ok(reply),
            Err(e) if e.is_circuit_open() || e.root().is_transport() => {
                let spent =
                    Duration::from_millis(self.clock.now_millis().saturating_sub(stage_start));
                let remaining = budget.saturating_sub(spent);
                if remaining.is_zero() {
                    return Err(e);
                }
                tracing::info!(turn_id = %ctx.turn_id, %stage, error = %e,
                    "stage failed, retrying once with a fresh envelope");
                self.dispatch_once(ctx, kind, payload, remaining, cancel).await
            }
            Err(e) => Err(e),
        }
    }

    async fn dispatch_once(
        &self,
        ctx: &TurnContext,
        kind: AgentKind,
        payload: &[u8],
        budget: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, CoreError> {
        let env = Envelope::request(
            ctx.session_id.clone(),
            self.origin.clone(),
            AgentId::new(kind, "any"),
            payload.to_vec(),
            Priority::Normal,
            self.clock.wall() + budget,
        );
        let waiter = self.coordinator.submit(env).await?;
        let reply = waiter.await_reply(budget, cancel).await?;
        match reply.kind {
            MessageKind::Reply => Ok(reply.payload),
            MessageKind::Error => Err(CoreError::from_wire(&reply.payload)),
            other => {
                Err(CoreError::Protocol { detail: format!("unexpected {other:?} envelope") })
            }
        }
    }

    fn fail(&self, mut ctx: TurnContext, error: CoreError) -> TurnResult {
        let failed_stage = ctx.stage;
        // Deadline errors surface without stage context when the waiter
        // times out; pin them to the stage that was running.
        let error = match error {
            CoreError::DeadlineExceeded { stage: None } => {
                CoreError::DeadlineExceeded { stage: Some(failed_stage) }
            }
            other => other,
        };
        let status = if error.is_cancelled() { TurnStatus::Cancelled } else { TurnStatus::Failed };
        ctx.stage = Stage::Failed;

        tracing::warn!(turn_id = %ctx.turn_id, stage = %failed_stage, error = %error, "turn failed");
        self.events.emit(CoreEvent::Turn(TurnEvent::Failed {
            session_id: ctx.session_id.clone(),
            stage: failed_stage,
            code: error.code(),
        }));
        if let Some(stats) = &self.stats {
            stats.record(status, &ctx.stage_latencies);
        }

        TurnResult {
            turn_id: ctx.turn_id,
            artefacts: ctx.artefacts,
            stage_latencies: ctx.stage_latencies,
            terminal_status: status,
            error: Some(TurnError {
                code: error.code(),
                message: error.user_message(),
                stage: Some(failed_stage),
            }),
        }
    }
}
