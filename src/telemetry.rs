//! Telemetry and observability for the orchestration core.
//!
//! Every component emits structured events describing its behavior: retry
//! attempts, breaker transitions, queue movements, registry changes, dispatch
//! outcomes, and turn progress. Events flow through `TelemetrySink`
//! implementations, modeled as `tower::Service<CoreEvent>` so sinks compose
//! with standard tower combinators.
//!
//! Hot paths never block on telemetry: components hold an [`EventBus`], a
//! bounded channel drained by one owned worker task. When the channel is full
//! the event is dropped and counted, never awaited.

use crate::breaker::CircuitState;
use crate::envelope::{AgentKind, Priority, Stage};
use crate::queue::NackDisposition;
use crate::registry::AgentStatus;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A telemetry sink that consumes core events.
///
/// This is a constraint alias for a `tower::Service` over [`CoreEvent`].
/// Sinks must be cheap to clone; the bus clones per event.
pub trait TelemetrySink:
    tower::Service<CoreEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
///
/// Telemetry must not take down the pipeline: if a sink is not ready or
/// returns an error, the event is dropped.
pub async fn emit_best_effort<S>(sink: S, event: CoreEvent)
where
    S: tower::Service<CoreEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// Events emitted by the orchestration core.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    Retry(RetryEvent),
    Breaker(BreakerEvent),
    Queue(QueueEvent),
    Registry(RegistryEvent),
    Dispatch(DispatchEvent),
    Turn(TurnEvent),
    Health(HealthEvent),
}

/// Events emitted by the retry harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryEvent {
    /// A retry is about to be made after the given backoff delay.
    Attempt { attempt: usize, delay: Duration },
    /// All attempts were used up.
    Exhausted { attempts: usize },
}

/// A circuit breaker state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerEvent {
    pub key: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub reason: BreakerReason,
    pub failure_count: usize,
}

/// Why a breaker transitioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerReason {
    /// Consecutive failures reached the threshold.
    FailureThreshold,
    /// The open window elapsed and a probe was admitted.
    ProbeWindow,
    /// Enough consecutive probe successes.
    ProbeSuccess,
    /// A probe failed while half-open.
    ProbeFailure,
}

/// Queue movements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEvent {
    Enqueued { kind: AgentKind, priority: Priority, depth: usize },
    Reserved { kind: AgentKind, attempt: u32 },
    Acked { kind: AgentKind },
    Nacked { kind: AgentKind, disposition: NackDisposition },
    DeadLettered { kind: AgentKind, attempts: u32 },
    Reclaimed { kind: AgentKind, count: usize },
}

/// Registry lifecycle changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Registered { kind: AgentKind, instance: String },
    StatusChanged { kind: AgentKind, instance: String, from: AgentStatus, to: AgentStatus },
    Evicted { kind: AgentKind, instance: String },
}

/// Coordinator dispatch outcomes.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    /// An envelope was requeued because the target's breaker is open.
    BreakerSkip { kind: AgentKind, retry_after: Duration },
    /// The bridge call completed.
    Completed { kind: AgentKind, instance: String, latency: Duration, ok: bool },
    /// A reply arrived with no live waiter and was dead-lettered.
    OrphanReply { kind: AgentKind },
}

/// Workflow turn progress.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    StageCompleted { stage: Stage, latency: Duration },
    Completed { session_id: String, total: Duration },
    Failed { session_id: String, stage: Stage, code: &'static str },
}

/// Health monitor output.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthEvent {
    /// A configured alert threshold was crossed. Observation only.
    Alert { detail: String },
    /// Periodic aggregate.
    Tick { queued: usize, open_breakers: usize, unhealthy_agents: usize },
}

impl fmt::Display for CoreEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreEvent::Retry(e) => write!(f, "Retry::{e:?}"),
            CoreEvent::Breaker(e) => write!(
                f,
                "Breaker({} {:?}->{:?} {:?} failures={})",
                e.key, e.from, e.to, e.reason, e.failure_count
            ),
            CoreEvent::Queue(e) => write!(f, "Queue::{e:?}"),
            CoreEvent::Registry(e) => write!(f, "Registry::{e:?}"),
            CoreEvent::Dispatch(e) => write!(f, "Dispatch::{e:?}"),
            CoreEvent::Turn(e) => write!(f, "Turn::{e:?}"),
            CoreEvent::Health(e) => write!(f, "Health::{e:?}"),
        }
    }
}

// ============================================================================
// Built-in sinks
// ============================================================================

use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};
use tower::Service;

/// A no-op sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<CoreEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: CoreEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// A sink that logs events through `tracing` at INFO level.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<CoreEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: CoreEvent) -> Self::Future {
        tracing::info!(event = %event, "core_event");
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// A sink that stores events in memory. The workhorse of the test suites.
///
/// Bounded: oldest events are evicted past capacity.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<CoreEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySink {
    /// Bounded memory sink with the default capacity (10,000).
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity,
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Snapshot of recorded events.
    pub fn events(&self) -> Vec<CoreEvent> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    /// Recorded breaker transitions, in order.
    pub fn breaker_events(&self) -> Vec<BreakerEvent> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                CoreEvent::Breaker(b) => Some(b),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count of events evicted past capacity.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Service<CoreEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: CoreEvent) -> Self::Future {
        {
            let mut events =
                self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if events.len() >= self.capacity {
                events.remove(0);
                self.evicted.fetch_add(1, Ordering::Relaxed);
            }
            events.push(event);
        }
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

/// Error from a composed sink.
#[derive(Debug)]
pub struct ComposedSinkError(Box<dyn std::error::Error + Send + Sync>);

impl fmt::Display for ComposedSinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "composed sink error: {}", self.0)
    }
}

impl std::error::Error for ComposedSinkError {}

/// Fans every event out to two sinks. Nest for more.
#[derive(Clone, Debug)]
pub struct MulticastSink<A, B> {
    sink_a: A,
    sink_b: B,
}

impl<A, B> MulticastSink<A, B> {
    pub fn new(sink_a: A, sink_b: B) -> Self {
        Self { sink_a, sink_b }
    }
}

impl<A, B> Service<CoreEvent> for MulticastSink<A, B>
where
    A: TelemetrySink,
    A::Future: Send + 'static,
    A::SinkError: Sync,
    B: TelemetrySink,
    B::Future: Send + 'static,
    B::SinkError: Sync,
{
    type Response = ();
    type Error = ComposedSinkError;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        match self.sink_a.poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(ComposedSinkError(Box::new(e)))),
            Poll::Pending => return Poll::Pending,
        }
        match self.sink_b.poll_ready(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(ComposedSinkError(Box::new(e)))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn call(&mut self, event: CoreEvent) -> Self::Future {
        let fut_a = self.sink_a.call(event.clone());
        let fut_b = self.sink_b.call(event);
        Box::pin(async move {
            let (ra, rb) = futures::join!(fut_a, fut_b);
            ra.map_err(|e| ComposedSinkError(Box::new(e)))?;
            rb.map_err(|e| ComposedSinkError(Box::new(e)))?;
            Ok(())
        })
    }
}

impl<A, B> TelemetrySink for MulticastSink<A, B>
where
    A: TelemetrySink,
    A::Future: Send + 'static,
    A::SinkError: Sync,
    B: TelemetrySink,
    B::Future: Send + 'static,
    B::SinkError: Sync,
{
    type SinkError = ComposedSinkError;
}

// ============================================================================
// Event bus
// ============================================================================

/// Non-blocking handle through which components emit events.
///
/// Backed by a bounded channel drained by one owned worker task; when the
/// channel is full the event is dropped and counted. Cheap to clone.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: Option<tokio::sync::mpsc::Sender<CoreEvent>>,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    pub const DEFAULT_CAPACITY: usize = 1024;

    /// A bus that discards everything. For callers that don't observe.
    pub fn disabled() -> Self {
        Self { tx: None, dropped: Arc::new(AtomicU64::new(0)) }
    }

    /// Spawn the drain worker for `sink` and return the bus plus the worker
    /// handle. The worker exits once every bus clone is dropped; join it on
    /// shutdown.
    pub fn spawn<S>(sink: S) -> (Self, tokio::task::JoinHandle<()>)
    where
        S: TelemetrySink,
        S::Future: Send + 'static,
    {
        Self::spawn_with_capacity(sink, Self::DEFAULT_CAPACITY)
    }

    pub fn spawn_with_capacity<S>(sink: S, capacity: usize) -> (Self, tokio::task::JoinHandle<()>)
    where
        S: TelemetrySink,
        S::Future: Send + 'static,
    {
        let (tx, mut rx) = tokio::sync::mpsc::channel(capacity);
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                emit_best_effort(sink.clone(), event).await;
            }
        });
        (Self { tx: Some(tx), dropped: Arc::new(AtomicU64::new(0)) }, handle)
    }

    /// Emit without blocking. Full channel drops the event.
    pub fn emit(&self, event: CoreEvent) {
        if let Some(tx) = &self.tx {
            if tx.try_send(event).is_err() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Events dropped because the channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
