//! The narrow queue interface the coordinator speaks.
//!
//! Implementations rely on atomic backend operations; no cross-queue
//! transactions exist. Delivery is at-least-once: consumers must be
//! idempotent on envelope id. [`InMemoryQueue`] backs tests and
//! single-process deployments; the `turnloom-redis` crate provides the
//! production backend over the same trait.
//!
//! [`InMemoryQueue`]: crate::InMemoryQueue

use crate::envelope::{AgentKind, Envelope};
use crate::error::CoreError;
use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

/// Where a negatively-acknowledged envelope goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackDisposition {
    /// Restore to the head of its priority queue; does not count a delivery.
    Head,
    /// Append to the tail; counts a delivery attempt.
    Tail,
    /// Move to the dead-letter queue. Terminal until drained.
    DeadLetter,
}

/// Per-kind queue depths, split by live, in-flight, and dead-lettered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepths {
    pub queued: usize,
    pub in_flight: usize,
    pub dead_lettered: usize,
}

/// Persistent FIFO per `(agent kind, priority)` with reservations.
///
/// Ordering: strict priority preemption on reserve (High > Normal > Low),
/// FIFO within a priority for non-retried deliveries. Reservations expire
/// after their TTL and are reclaimed to the tail with an incremented attempt
/// counter, or dead-lettered past the delivery bound.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Append an envelope to the queue for `(env.to.kind, env.priority)`.
    ///
    /// When the queue is at capacity, waits up to the configured backpressure
    /// window, then fails with `Overloaded`.
    async fn enqueue(&self, env: Envelope) -> Result<(), CoreError>;

    /// Atomically move the head of the highest non-empty priority queue for
    /// `kind` into the in-flight set, reserved for `reservation_ttl`.
    async fn reserve(
        &self,
        kind: AgentKind,
        consumer_id: &str,
    ) -> Result<Option<Envelope>, CoreError>;

    /// Positively acknowledge a reserved envelope, removing it for good.
    async fn ack(&self, kind: AgentKind, id: Uuid) -> Result<(), CoreError>;

    /// Negatively acknowledge a reserved envelope per `disposition`.
    async fn nack(
        &self,
        kind: AgentKind,
        id: Uuid,
        disposition: NackDisposition,
    ) -> Result<(), CoreError>;

    /// Sweep expired reservations for `kind` back to the tail (or the DLQ
    /// past the delivery bound). Returns how many were reclaimed.
    async fn reclaim_expired(&self, kind: AgentKind) -> Result<usize, CoreError>;

    /// Current depths for `kind`.
    async fn depths(&self, kind: AgentKind) -> Result<QueueDepths, CoreError>;

    /// Age of the oldest queued envelope for `kind`, if any.
    async fn oldest_age(&self, kind: AgentKind) -> Result<Option<Duration>, CoreError>;

    /// Remove and return every dead-lettered envelope for `kind`. The only
    /// way entries ever leave the DLQ.
    async fn drain_dead_letters(&self, kind: AgentKind) -> Result<Vec<Envelope>, CoreError>;
}
