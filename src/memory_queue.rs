//! In-memory queue backend.
//!
//! Mirrors the Redis layout one-to-one: a FIFO per `(kind, priority)`, an
//! in-flight reservation set with expiry, and a dead-letter list per kind.
//! Used by the test suites and by single-process deployments; swapping in the
//! Redis backend never touches the coordinator.

use crate::clock::{Clock, MonotonicClock};
use crate::config::QueueConfig;
use crate::envelope::{AgentKind, Envelope, Priority};
use crate::error::CoreError;
use crate::queue::{MessageQueue, NackDisposition, QueueDepths};
use crate::telemetry::{CoreEvent, EventBus, QueueEvent};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

struct InFlight {
    env: Envelope,
    reserved_until_millis: u64,
}

#[derive(Default)]
struct KindState {
    /// One FIFO per priority, in strict dequeue order High, Normal, Low.
    queues: [VecDeque<Envelope>; 3],
    in_flight: HashMap<Uuid, InFlight>,
    dead: Vec<Envelope>,
}

impl KindState {
    fn queued(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    fn queue_mut(&mut self, priority: Priority) -> &mut VecDeque<Envelope> {
        let idx = Priority::ORDERED.iter().position(|p| *p == priority).unwrap_or(1);
        &mut self.queues[idx]
    }
}

/// In-memory `MessageQueue` with the full reservation protocol.
pub struct InMemoryQueue {
    state: Mutex<HashMap<AgentKind, KindState>>,
    space_freed: Notify,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl InMemoryQueue {
    pub fn new(config: QueueConfig, events: EventBus) -> Self {
        Self::with_clock(config, events, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(config: QueueConfig, events: EventBus, clock: Arc<dyn Clock>) -> Self {
        Self { state: Mutex::new(HashMap::new()), space_freed: Notify::new(), config, clock, events }
    }

    fn dead_letter(&self, state: &mut KindState, kind: AgentKind, env: Envelope) {
        self.events.emit(CoreEvent::Queue(QueueEvent::DeadLettered {
            kind,
            attempts: env.attempt,
        }));
        tracing::warn!(kind = %kind, id = %env.id, attempt = env.attempt, "envelope dead-lettered");
        state.dead.push(env);
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn enqueue(&self, mut env: Envelope) -> Result<(), CoreError> {
        let kind = env.to.kind;
        if env.enqueued_at.is_none() {
            env.enqueued_at = Some(self.clock.wall());
        }

        let wait_until = self.clock.now_millis() + self.config.enqueue_wait.as_millis() as u64;
        loop {
            {
                let mut map = self.state.lock().await;
                let state = map.entry(kind).or_default();
                let depth = state.queued();
                if depth < self.config.max_depth {
                    let priority = env.priority;
                    state.queue_mut(priority).push_back(env);
                    self.events.emit(CoreEvent::Queue(QueueEvent::Enqueued {
                        kind,
                        priority,
                        depth: depth + 1,
                    }));
                    return Ok(());
                }
                if self.clock.now_millis() >= wait_until {
                    return Err(CoreError::Overloaded { kind, depth });
                }
            }
            // Wait for a consumer to free space, bounded by the remaining window.
            let remaining =
                Duration::from_millis(wait_until.saturating_sub(self.clock.now_millis()));
            let _ = tokio::time::timeout(remaining, self.space_freed.notified()).await;
        }
    }

    async fn reserve(
        &self,
        kind: AgentKind,
        consumer_id: &str,
    ) -> Result<Option<Envelope>, CoreError> {
        let now_wall = self.clock.wall();
        let mut map = self.state.lock().await;
        let state = map.entry(kind).or_default();

        for idx in 0..state.queues.len() {
            while let Some(mut env) = state.queues[idx].pop_front() {
                if env.is_expired(now_wall) {
                    self.dead_letter(state, kind, env);
                    continue;
                }
                env.dequeued_at = Some(now_wall);
                let reserved_until_millis =
                    self.clock.now_millis() + self.config.reservation_ttl.as_millis() as u64;
                let out = env.clone();
                state.in_flight.insert(env.id, InFlight { env, reserved_until_millis });
                self.events
                    .emit(CoreEvent::Queue(QueueEvent::Reserved { kind, attempt: out.attempt }));
                tracing::debug!(kind = %kind, id = %out.id, consumer_id, "envelope reserved");
                self.space_freed.notify_waiters();
                return Ok(Some(out));
            }
        }
        Ok(None)
    }

    async fn ack(&self, kind: AgentKind, id: Uuid) -> Result<(), CoreError> {
        let mut map = self.state.lock().await;
        let state = map.entry(kind).or_default();
        match state.in_flight.remove(&id) {
            Some(_) => {
                self.events.emit(CoreEvent::Queue(QueueEvent::Acked { kind }));
                Ok(())
            }
            None => Err(CoreError::Protocol {
                detail: format!("ack for {id} without a live reservation"),
            }),
        }
    }

    async fn nack(
        &self,
        kind: AgentKind,
        id: Uuid,
        disposition: NackDisposition,
    ) -> Result<(), CoreError> {
        let mut map = self.state.lock().await;
        let state = map.entry(kind).or_default();
        let Some(held) = state.in_flight.remove(&id) else {
            return Err(CoreError::Protocol {
                detail: format!("nack for {id} without a live reservation"),
            });
        };
        let mut env = held.env;

        match disposition {
            NackDisposition::Head => {
                let priority = env.priority;
                state.queue_mut(priority).push_front(env);
            }
            NackDisposition::Tail => {
                env.attempt += 1;
                if env.attempt > self.config.max_delivery_attempts {
                    self.dead_letter(state, kind, env);
                } else {
                    let priority = env.priority;
                    state.queue_mut(priority).push_back(env);
                }
            }
            NackDisposition::DeadLetter => {
                self.dead_letter(state, kind, env);
            }
        }
        self.events.emit(CoreEvent::Queue(QueueEvent::Nacked { kind, disposition }));
        Ok(())
    }

    async fn reclaim_expired(&self, kind: AgentKind) -> Result<usize, CoreError> {
        let now = self.clock.now_millis();
        let mut map = self.state.lock().await;
        let state = map.entry(kind).or_default();

        let expired: Vec<Uuid> = state
            .in_flight
            .iter()
            .filter(|(_, held)| held.reserved_until_millis <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            let Some(held) = state.in_flight.remove(id) else { continue };
            let mut env = held.env;
            env.attempt += 1;
            env.dequeued_at = None;
            if env.attempt > self.config.max_delivery_attempts {
                self.dead_letter(state, kind, env);
            } else {
                let priority = env.priority;
                state.queue_mut(priority).push_back(env);
            }
        }

        if !expired.is_empty() {
            self.events
                .emit(CoreEvent::Queue(QueueEvent::Reclaimed { kind, count: expired.len() }));
        }
        Ok(expired.len())
    }

    async fn depths(&self, kind: AgentKind) -> Result<QueueDepths, CoreError> {
        let mut map = self.state.lock().await;
        let state = map.entry(kind).or_default();
        Ok(QueueDepths {
            queued: state.queued(),
            in_flight: state.in_flight.len(),
            dead_lettered: state.dead.len(),
        })
    }

    async fn oldest_age(&self, kind: AgentKind) -> Result<Option<Duration>, CoreError> {
        let now = self.clock.wall();
        let mut map = self.state.lock().await;
        let state = map.entry(kind).or_default();
        let oldest = state
            .queues
            .iter()
            .flatten()
            .filter_map(|env| env.enqueued_at)
            .filter_map(|at| now.duration_since(at).ok())
            .max();
        Ok(oldest)
    }

    async fn drain_dead_letters(&self, kind: AgentKind) -> Result<Vec<Envelope>, CoreError> {
        let mut map = self.state.lock().await;
        let state = map.entry(kind).or_default();
        Ok(std::mem::take(&mut state.dead))
    }
}
