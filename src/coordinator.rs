//! Message coordinator: reserve → route → dispatch → ack.
//!
//! One worker pool per agent kind drives the dispatch cycle; a reply loop
//! over the `External` queue resolves correlation waiters; a reclaimer task
//! sweeps expired reservations. Every worker is an owned task joined on
//! shutdown, and every suspension point honors the cancellation token.
//!
//! Ordering: envelopes for the same `(session, target kind)` are serialized
//! through an in-flight slot; a busy slot puts the envelope back at the head
//! of its queue so in-session FIFO order survives. Priority preemption is a
//! cross-session affair only.

use crate::bridge::AgentTransport;
use crate::breaker_registry::BreakerRegistry;
use crate::clock::{Clock, MonotonicClock};
use crate::config::CoreConfig;
use crate::envelope::{AgentId, AgentKind, Envelope, MessageKind};
use crate::error::CoreError;
use crate::queue::{MessageQueue, NackDisposition};
use crate::registry::AgentRegistry;
use crate::retry::RetryPolicy;
use crate::telemetry::{CoreEvent, DispatchEvent, EventBus};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Pending reply channels keyed by originating request id.
#[derive(Debug, Default, Clone)]
struct ReplyRouter {
    waiters: Arc<Mutex<HashMap<Uuid, oneshot::Sender<Envelope>>>>,
}

impl ReplyRouter {
    fn register(&self, id: Uuid) -> oneshot::Receiver<Envelope> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).insert(id, tx);
        rx
    }

    fn forget(&self, id: &Uuid) {
        self.waiters.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).remove(id);
    }

    /// Deliver a reply to its waiter. False when no waiter is live.
    fn resolve(&self, correlation_id: &Uuid, env: Envelope) -> bool {
        let waiter = self
            .waiters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(correlation_id);
        match waiter {
            Some(tx) => tx.send(env).is_ok(),
            None => false,
        }
    }
}

/// At most one in-flight request per `(session, target kind)`.
#[derive(Default, Clone)]
struct SessionSlots {
    held: Arc<Mutex<HashSet<(String, AgentKind)>>>,
}

impl SessionSlots {
    fn try_acquire(&self, session_id: &str, kind: AgentKind) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert((session_id.to_string(), kind))
    }

    fn release(&self, session_id: &str, kind: AgentKind) {
        self.held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&(session_id.to_string(), kind));
    }
}

/// Handle for one submitted request, resolved by the reply loop.
#[derive(Debug)]
pub struct ReplyWaiter {
    id: Uuid,
    rx: oneshot::Receiver<Envelope>,
    router: ReplyRouter,
}

impl ReplyWaiter {
    /// The submitted request's envelope id.
    pub fn request_id(&self) -> Uuid {
        self.id
    }

    /// Wait for the correlated reply within `budget`.
    ///
    /// Cancellation and budget exhaustion abandon the waiter; a reply that
    /// arrives later finds no waiter and is dead-lettered by the reply loop.
    pub async fn await_reply(
        mut self,
        budget: Duration,
        cancel: &CancellationToken,
    ) -> Result<Envelope, CoreError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(CoreError::Cancelled),
            _ = tokio::time::sleep(budget) => Err(CoreError::DeadlineExceeded { stage: None }),
            reply = &mut self.rx => reply.map_err(|_| CoreError::Transport {
                detail: "reply channel closed by the coordinator".into(),
            }),
        }
    }
}

impl Drop for ReplyWaiter {
    fn drop(&mut self) {
        self.router.forget(&self.id);
    }
}

struct CoordinatorInner {
    queue: Arc<dyn MessageQueue>,
    registry: Arc<AgentRegistry>,
    breakers: BreakerRegistry,
    transport: Arc<dyn AgentTransport>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    events: EventBus,
    replies: ReplyRouter,
    sessions: SessionSlots,
    dispatch_permits: Semaphore,
    cursors: HashMap<AgentKind, AtomicUsize>,
    poll_interval: Duration,
    reclaim_interval: Duration,
    max_delivery_attempts: u32,
}

/// Routes envelopes between queues, agents, and waiters.
pub struct MessageCoordinator {
    inner: Arc<CoordinatorInner>,
    workers_per_kind: usize,
    handles: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl MessageCoordinator {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        registry: Arc<AgentRegistry>,
        transport: Arc<dyn AgentTransport>,
        config: &CoreConfig,
        events: EventBus,
    ) -> Self {
        let cursors =
            AgentKind::ALL.iter().map(|kind| (*kind, AtomicUsize::new(0))).collect();
        Self {
            inner: Arc::new(CoordinatorInner {
                queue,
                registry,
                breakers: BreakerRegistry::new(config.breaker.clone(), events.clone()),
                transport,
                retry: RetryPolicy::from_config(&config.retry, events.clone()),
                clock: Arc::new(MonotonicClock::default()),
                events,
                replies: ReplyRouter::default(),
                sessions: SessionSlots::default(),
                dispatch_permits: Semaphore::new(config.coordinator.max_concurrent_dispatches),
                cursors,
                poll_interval: config.coordinator.poll_interval,
                reclaim_interval: config.coordinator.reclaim_interval,
                max_delivery_attempts: config.queue.max_delivery_attempts,
            }),
            workers_per_kind: config.coordinator.workers_per_kind,
            handles: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// The shared breaker registry, for health snapshots.
    pub fn breakers(&self) -> BreakerRegistry {
        self.inner.breakers.clone()
    }

    /// Spawn the worker pools for `kinds`, the reply loop, and the reclaimer.
    pub fn start(&self, kinds: &[AgentKind]) {
        let mut handles = self.handles.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for &kind in kinds {
            for worker in 0..self.workers_per_kind {
                let inner = self.inner.clone();
                let cancel = self.cancel.clone();
                handles.push(tokio::spawn(async move {
                    worker_loop(inner, cancel, kind, worker).await;
                }));
            }
        }

        let inner = self.inner.clone();
        let cancel = self.cancel.clone();
        handles.push(tokio::spawn(async move {
            reply_loop(inner, cancel).await;
        }));

        let inner = self.inner.clone();
        let cancel = self.cancel.clone();
        let reclaim_kinds: Vec<AgentKind> = kinds.to_vec();
        handles.push(tokio::spawn(async move {
            reclaim_loop(inner, cancel, reclaim_kinds).await;
        }));
    }

    /// Cancel every worker and join them.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut guard =
                self.handles.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Submit a request on behalf of the front-end and obtain the waiter for
    /// its correlated reply.
    pub async fn submit(&self, env: Envelope) -> Result<ReplyWaiter, CoreError> {
        if env.kind != MessageKind::Request {
            return Err(CoreError::Protocol {
                detail: format!("submit accepts requests only, got {:?}", env.kind),
            });
        }
        let waiter = ReplyWaiter {
            id: env.id,
            rx: self.inner.replies.register(env.id),
            router: self.inner.replies.clone(),
        };
        self.inner.queue.enqueue(env).await?;
        Ok(waiter)
    }

    /// Admin surface: drain one kind's dead letters.
    pub async fn drain_dead_letters(
        &self,
        kind: AgentKind,
    ) -> Result<Vec<Envelope>, CoreError> {
        self.inner.queue.drain_dead_letters(kind).await
    }
}

/// Delivery window for error envelopes reporting a failure back to the
/// originator. Independent of the failed request's own (possibly expired)
/// deadline.
const ERROR_ENVELOPE_TTL: Duration = Duration::from_secs(30);

/// Cancellable sleep; true when cancellation fired.
async fn idle(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

/// Consecutive reserve failures before a worker treats the queue backend as
/// unavailable and backs off for a cool-down instead of hot-polling it.
const QUEUE_FAILURE_COOLDOWN_AFTER: u32 = 4;

async fn worker_loop(
    inner: Arc<CoordinatorInner>,
    cancel: CancellationToken,
    kind: AgentKind,
    worker: usize,
) {
    let consumer_id = format!("{kind}-worker-{worker}");
    tracing::debug!(%consumer_id, "coordinator worker started");

    let mut reserve_failures = 0u32;
    while !cancel.is_cancelled() {
        match inner.queue.reserve(kind, &consumer_id).await {
            Ok(Some(env)) => {
                reserve_failures = 0;
                process(&inner, &cancel, kind, env).await;
            }
            Ok(None) => {
                reserve_failures = 0;
                if idle(&cancel, inner.poll_interval).await {
                    break;
                }
            }
            Err(e) => {
                reserve_failures += 1;
                let delay = if reserve_failures >= QUEUE_FAILURE_COOLDOWN_AFTER {
                    tracing::error!(kind = %kind, error = %e, reserve_failures,
                        "queue unavailable, cooling down");
                    inner.poll_interval * 40
                } else {
                    tracing::warn!(kind = %kind, error = %e, "queue reserve failed");
                    inner.poll_interval
                };
                if idle(&cancel, delay).await {
                    break;
                }
            }
        }
    }
    tracing::debug!(%consumer_id, "coordinator worker stopped");
}

async fn process(
    inner: &Arc<CoordinatorInner>,
    cancel: &CancellationToken,
    kind: AgentKind,
    env: Envelope,
) {
    if env.kind != MessageKind::Request {
        // Agent queues carry requests; anything else is a routing fault.
        fail_envelope(
            inner,
            kind,
            &env,
            CoreError::Protocol { detail: format!("{:?} envelope on the {kind} queue", env.kind) },
        )
        .await;
        return;
    }

    if env.is_expired(inner.clock.wall()) {
        fail_envelope(inner, kind, &env, CoreError::DeadlineExceeded { stage: None }).await;
        return;
    }

    // Per-session serialization: a busy slot sends the envelope back to the
    // head so in-session order is preserved, then backs off briefly.
    if !inner.sessions.try_acquire(&env.session_id, kind) {
        requeue(inner, kind, &env, NackDisposition::Head).await;
        idle(cancel, inner.poll_interval).await;
        return;
    }

    dispatch(inner, cancel, kind, &env).await;
    inner.sessions.release(&env.session_id, kind);
}

async fn dispatch(
    inner: &Arc<CoordinatorInner>,
    cancel: &CancellationToken,
    kind: AgentKind,
    env: &Envelope,
) {
    let Some(cursor) = inner.cursors.get(&kind) else {
        fail_envelope(inner, kind, env, CoreError::UnknownAgent { kind }).await;
        return;
    };
    let Some(instance) = inner.registry.select(kind, cursor) else {
        fail_envelope(inner, kind, env, CoreError::UnknownAgent { kind }).await;
        return;
    };

    let breaker = inner.breakers.get_or_create(&instance.breaker_key());
    let permit = match breaker.try_acquire() {
        Ok(permit) => permit,
        Err(CoreError::CircuitOpen { key, retry_after }) => {
            inner
                .events
                .emit(CoreEvent::Dispatch(DispatchEvent::BreakerSkip { kind, retry_after }));
            retryable_failure(
                inner,
                kind,
                env,
                CoreError::CircuitOpen { key, retry_after },
            )
            .await;
            // Back off in proportion to the probe window so the envelope is
            // not hot-looped against a closed door.
            idle(cancel, retry_after.min(inner.poll_interval * 4)).await;
            return;
        }
        Err(e) => {
            fail_envelope(inner, kind, env, e).await;
            return;
        }
    };

    let Ok(_dispatch_permit) = inner.dispatch_permits.acquire().await else {
        permit.record(false);
        requeue(inner, kind, env, NackDisposition::Head).await;
        return;
    };

    let started = inner.clock.now_millis();
    let outcome = inner
        .retry
        .execute(cancel, || {
            let transport = inner.transport.clone();
            let clock = inner.clock.clone();
            let instance = instance.clone();
            let request = env.clone();
            async move {
                let remaining = request
                    .remaining(clock.wall())
                    .ok_or(CoreError::DeadlineExceeded { stage: None })?;
                transport.send(&instance, request, remaining).await
            }
        })
        .await;
    let latency = Duration::from_millis(inner.clock.now_millis().saturating_sub(started));

    match outcome {
        Ok(reply) => {
            permit.record(true);
            inner.events.emit(CoreEvent::Dispatch(DispatchEvent::Completed {
                kind,
                instance: instance.instance.clone(),
                latency,
                ok: true,
            }));
            deliver_reply(inner, kind, env, reply).await;
        }
        Err(e) if e.is_cancelled() => {
            // Shutdown mid-dispatch: leave the envelope for the next run.
            permit.record(false);
            requeue(inner, kind, env, NackDisposition::Head).await;
        }
        Err(e) => {
            permit.record(false);
            inner.events.emit(CoreEvent::Dispatch(DispatchEvent::Completed {
                kind,
                instance: instance.instance.clone(),
                latency,
                ok: false,
            }));
            if e.root().is_retryable() {
                retryable_failure(inner, kind, env, e).await;
            } else {
                fail_envelope(inner, kind, env, e).await;
            }
        }
    }
}

/// Ack the request and hand its reply to the originator's queue.
async fn deliver_reply(
    inner: &Arc<CoordinatorInner>,
    kind: AgentKind,
    env: &Envelope,
    reply: Envelope,
) {
    if let Err(e) = inner.queue.enqueue(reply).await {
        tracing::error!(kind = %kind, id = %env.id, error = %e, "failed to enqueue reply");
    }
    if let Err(e) = inner.queue.ack(kind, env.id).await {
        tracing::warn!(kind = %kind, id = %env.id, error = %e, "ack failed");
    }
}

/// Retryable outcome: back to the tail while attempts remain, then the DLQ
/// with an error envelope for the originator.
async fn retryable_failure(
    inner: &Arc<CoordinatorInner>,
    kind: AgentKind,
    env: &Envelope,
    error: CoreError,
) {
    if env.attempt < inner.max_delivery_attempts {
        tracing::debug!(kind = %kind, id = %env.id, attempt = env.attempt, error = %error,
            "dispatch failed, requeueing");
        requeue(inner, kind, env, NackDisposition::Tail).await;
    } else {
        fail_envelope(inner, kind, env, error).await;
    }
}

/// Fatal outcome: dead-letter the request and report the failure to the
/// originator as an error envelope.
async fn fail_envelope(
    inner: &Arc<CoordinatorInner>,
    kind: AgentKind,
    env: &Envelope,
    error: CoreError,
) {
    tracing::warn!(kind = %kind, id = %env.id, error = %error, "envelope failed");
    requeue(inner, kind, env, NackDisposition::DeadLetter).await;

    let mut error_env =
        Envelope::error_to(env, AgentId::new(kind, "coordinator"), error.to_wire());
    // The request's own deadline may already be behind us; give the error
    // report a delivery window of its own so the waiter hears about it.
    error_env.deadline = inner.clock.wall() + ERROR_ENVELOPE_TTL;
    if let Err(e) = inner.queue.enqueue(error_env).await {
        tracing::error!(kind = %kind, id = %env.id, error = %e, "failed to send error envelope");
    }
}

async fn requeue(
    inner: &Arc<CoordinatorInner>,
    kind: AgentKind,
    env: &Envelope,
    disposition: NackDisposition,
) {
    if let Err(e) = inner.queue.nack(kind, env.id, disposition).await {
        tracing::warn!(kind = %kind, id = %env.id, error = %e, "nack failed");
    }
}

/// Drains the `External` queue, resolving correlation waiters. Replies with
/// no live waiter are orphans and go to the dead-letter queue.
async fn reply_loop(inner: Arc<CoordinatorInner>, cancel: CancellationToken) {
    let kind = AgentKind::External;
    while !cancel.is_cancelled() {
        match inner.queue.reserve(kind, "reply-loop").await {
            Ok(Some(env)) => {
                let resolved = match (env.kind, env.correlation_id) {
                    (MessageKind::Reply | MessageKind::Error, Some(correlation_id)) => {
                        inner.replies.resolve(&correlation_id, env.clone())
                    }
                    _ => false,
                };
                if resolved {
                    if let Err(e) = inner.queue.ack(kind, env.id).await {
                        tracing::warn!(id = %env.id, error = %e, "reply ack failed");
                    }
                } else {
                    inner
                        .events
                        .emit(CoreEvent::Dispatch(DispatchEvent::OrphanReply { kind: env.from.kind }));
                    tracing::debug!(id = %env.id, "orphan reply dead-lettered");
                    let _ = inner.queue.nack(kind, env.id, NackDisposition::DeadLetter).await;
                }
            }
            Ok(None) => {
                if idle(&cancel, inner.poll_interval).await {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "reply loop reserve failed");
                if idle(&cancel, inner.poll_interval).await {
                    break;
                }
            }
        }
    }
}

/// Periodic sweep of expired reservations for every serviced kind.
async fn reclaim_loop(
    inner: Arc<CoordinatorInner>,
    cancel: CancellationToken,
    kinds: Vec<AgentKind>,
) {
    loop {
        if idle(&cancel, inner.reclaim_interval).await {
            break;
        }
        for &kind in kinds.iter().chain([AgentKind::External].iter()) {
            match inner.queue.reclaim_expired(kind).await {
                Ok(0) => {}
                Ok(count) => tracing::info!(kind = %kind, count, "reclaimed expired reservations"),
                Err(e) => tracing::warn!(kind = %kind, error = %e, "reclaim failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::MockTransport;
    use crate::config::{CoreConfig, RetryConfig};
    use crate::envelope::Priority;
    use crate::memory_queue::InMemoryQueue;
    use crate::registry::AgentRegistry;
    use std::collections::HashSet;
    use std::time::SystemTime;

    struct Fixture {
        coordinator: MessageCoordinator,
        transport: Arc<MockTransport>,
        registry: Arc<AgentRegistry>,
        queue: Arc<InMemoryQueue>,
        cancel: CancellationToken,
    }

    fn fast_config() -> CoreConfig {
        let mut config = CoreConfig::default();
        config.retry = RetryConfig {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            multiplier: 2.0,
            jitter_max: Duration::ZERO,
            max_attempts: 2,
        };
        config.coordinator.poll_interval = Duration::from_millis(5);
        config.coordinator.reclaim_interval = Duration::from_millis(50);
        config
    }

    fn fixture(config: CoreConfig) -> Fixture {
        let events = EventBus::disabled();
        let queue = Arc::new(InMemoryQueue::new(config.queue.clone(), events.clone()));
        let registry =
            Arc::new(AgentRegistry::new(config.registry.clone(), events.clone()));
        let transport = Arc::new(MockTransport::new());
        let coordinator = MessageCoordinator::new(
            queue.clone(),
            registry.clone(),
            transport.clone(),
            &config,
            events,
        );
        Fixture { coordinator, transport, registry, queue, cancel: CancellationToken::new() }
    }

    fn register_agent(registry: &AgentRegistry, kind: AgentKind, instance: &str) {
        let id = AgentId::new(kind, instance);
        registry.register(id.clone(), HashSet::new());
        registry.heartbeat(&id).unwrap();
    }

    fn request(session: &str, kind: AgentKind) -> Envelope {
        Envelope::request(
            session,
            AgentId::new(AgentKind::External, "front"),
            AgentId::new(kind, "any"),
            b"payload".to_vec(),
            Priority::Normal,
            SystemTime::now() + Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn dispatches_and_resolves_the_correlated_reply() {
        let fx = fixture(fast_config());
        register_agent(&fx.registry, AgentKind::Ipa, "ipa-0");
        fx.transport.static_reply(AgentKind::Ipa, "ipa-ok");
        fx.coordinator.start(&[AgentKind::Ipa]);

        let env = request("sess-1", AgentKind::Ipa);
        let waiter = fx.coordinator.submit(env.clone()).await.unwrap();
        let reply = waiter.await_reply(Duration::from_secs(2), &fx.cancel).await.unwrap();

        assert_eq!(reply.kind, MessageKind::Reply);
        assert_eq!(reply.payload, b"ipa-ok");
        assert_eq!(reply.correlation_id, Some(env.id));
        assert_eq!(fx.transport.requests_for(AgentKind::Ipa).len(), 1);

        fx.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn missing_agent_returns_an_unknown_agent_error_envelope() {
        let fx = fixture(fast_config());
        fx.coordinator.start(&[AgentKind::Wba]);

        let waiter = fx.coordinator.submit(request("sess-1", AgentKind::Wba)).await.unwrap();
        let reply = waiter.await_reply(Duration::from_secs(2), &fx.cancel).await.unwrap();

        assert_eq!(reply.kind, MessageKind::Error);
        let err = CoreError::from_wire(&reply.payload);
        assert!(matches!(err, CoreError::UnknownAgent { .. }));

        fx.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn persistent_transport_failure_dead_letters_with_an_error_envelope() {
        let fx = fixture(fast_config());
        register_agent(&fx.registry, AgentKind::Wba, "wba-0");
        fx.transport.fail_then_reply(
            AgentKind::Wba,
            u32::MAX,
            CoreError::Transport { detail: "connection reset".into() },
            "",
        );
        fx.coordinator.start(&[AgentKind::Wba]);

        let waiter = fx.coordinator.submit(request("sess-1", AgentKind::Wba)).await.unwrap();
        let reply = waiter.await_reply(Duration::from_secs(5), &fx.cancel).await.unwrap();

        assert_eq!(reply.kind, MessageKind::Error);
        assert!(CoreError::from_wire(&reply.payload).is_transport());

        let dead = fx.coordinator.drain_dead_letters(AgentKind::Wba).await.unwrap();
        assert_eq!(dead.len(), 1, "the request itself is dead-lettered");

        fx.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn open_breaker_skips_the_backend_entirely() {
        let mut config = fast_config();
        config.breaker.failure_threshold = 2;
        config.breaker.open_duration = Duration::from_secs(60);
        config.queue.max_delivery_attempts = 2;
        let fx = fixture(config);
        register_agent(&fx.registry, AgentKind::Wba, "wba-0");
        fx.transport.fail_then_reply(
            AgentKind::Wba,
            u32::MAX,
            CoreError::Transport { detail: "down".into() },
            "",
        );
        fx.coordinator.start(&[AgentKind::Wba]);

        // First request trips the breaker (2 harness attempts = 2 failures).
        let waiter = fx.coordinator.submit(request("sess-1", AgentKind::Wba)).await.unwrap();
        let _ = waiter.await_reply(Duration::from_secs(5), &fx.cancel).await.unwrap();
        let calls_after_trip = fx.transport.calls(AgentKind::Wba);

        // Second request is breaker-skipped: the backend sees no new calls.
        let waiter = fx.coordinator.submit(request("sess-2", AgentKind::Wba)).await.unwrap();
        let reply = waiter.await_reply(Duration::from_secs(5), &fx.cancel).await.unwrap();
        assert!(CoreError::from_wire(&reply.payload).is_circuit_open());
        assert_eq!(fx.transport.calls(AgentKind::Wba), calls_after_trip);

        fx.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn orphan_replies_are_dead_lettered() {
        let fx = fixture(fast_config());
        fx.coordinator.start(&[]);

        let origin = request("sess-1", AgentKind::Ipa);
        let orphan = Envelope::reply_to(&origin, AgentId::new(AgentKind::Ipa, "ipa-0"), b"late".to_vec());
        fx.queue.enqueue(orphan).await.unwrap();

        // Give the reply loop a few polls to pick it up.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let dead = fx.queue.drain_dead_letters(AgentKind::External).await.unwrap();
        assert_eq!(dead.len(), 1);

        fx.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn abandoned_waiter_turns_the_reply_into_an_orphan() {
        let fx = fixture(fast_config());
        register_agent(&fx.registry, AgentKind::Ipa, "ipa-0");
        fx.transport.static_reply(AgentKind::Ipa, "late-ok");
        fx.coordinator.start(&[AgentKind::Ipa]);

        let waiter = fx.coordinator.submit(request("sess-1", AgentKind::Ipa)).await.unwrap();
        drop(waiter); // caller gave up before the reply came back

        tokio::time::sleep(Duration::from_millis(200)).await;
        let dead = fx.queue.drain_dead_letters(AgentKind::External).await.unwrap();
        assert_eq!(dead.len(), 1, "the late reply is dead-lettered, not leaked");

        fx.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn submit_rejects_non_requests() {
        let fx = fixture(fast_config());
        let origin = request("sess-1", AgentKind::Ipa);
        let reply =
            Envelope::reply_to(&origin, AgentId::new(AgentKind::Ipa, "ipa-0"), Vec::new());
        assert!(fx.coordinator.submit(reply).await.unwrap_err().is_protocol());
    }

    #[tokio::test]
    async fn expired_envelope_is_dead_lettered_without_dispatch() {
        let fx = fixture(fast_config());
        register_agent(&fx.registry, AgentKind::Ipa, "ipa-0");
        fx.transport.static_reply(AgentKind::Ipa, "never");
        fx.coordinator.start(&[AgentKind::Ipa]);

        let mut env = request("sess-1", AgentKind::Ipa);
        env.deadline = SystemTime::now() - Duration::from_secs(1);
        let waiter = fx.coordinator.submit(env).await.unwrap();

        // The queue dead-letters past-deadline envelopes on reserve, so the
        // waiter's own budget is the only thing left to fire.
        let err = waiter.await_reply(Duration::from_millis(300), &fx.cancel).await.unwrap_err();
        assert!(err.is_deadline());
        assert_eq!(fx.transport.calls(AgentKind::Ipa), 0, "expired work never reaches the backend");
        let dead = fx.coordinator.drain_dead_letters(AgentKind::Ipa).await.unwrap();
        assert_eq!(dead.len(), 1);

        fx.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_joins_every_worker() {
        let fx = fixture(fast_config());
        fx.coordinator.start(&[AgentKind::Ipa, AgentKind::Wba]);
        fx.coordinator.shutdown().await;
        assert!(fx.coordinator.handles.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn same_session_requests_are_both_served() {
        let fx = fixture(fast_config());
        register_agent(&fx.registry, AgentKind::Ipa, "ipa-0");
        fx.transport.static_reply(AgentKind::Ipa, "ok");
        fx.coordinator.start(&[AgentKind::Ipa]);

        let w1 = fx.coordinator.submit(request("sess-1", AgentKind::Ipa)).await.unwrap();
        let w2 = fx.coordinator.submit(request("sess-1", AgentKind::Ipa)).await.unwrap();
        let r1 = w1.await_reply(Duration::from_secs(2), &fx.cancel).await.unwrap();
        let r2 = w2.await_reply(Duration::from_secs(2), &fx.cancel).await.unwrap();
        assert_eq!(r1.payload, b"ok");
        assert_eq!(r2.payload, b"ok");

        fx.coordinator.shutdown().await;
    }
}
