//! The envelope: the unit of transport between agents.
//!
//! Envelopes are owned by the queue they sit in; at most one consumer holds a
//! reservation at a time. The binary form is a single `FORMAT_VERSION` byte
//! followed by a JSON body, so readers can reject foreign versions before
//! touching the payload.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// Leading byte of every serialized envelope.
pub const FORMAT_VERSION: u8 = 1;

/// Upper bound on caller-serialized payload bytes.
pub const MAX_PAYLOAD_BYTES: usize = 256 * 1024;

/// Logical agent kinds addressable by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentKind {
    /// Input processor.
    Ipa,
    /// World builder.
    Wba,
    /// Narrative generator.
    Nga,
    /// Development/tooling agent.
    OpenHands,
    /// Safety policy agent.
    Safety,
    /// The front-end / workflow side of a conversation.
    External,
}

impl AgentKind {
    /// All kinds, for per-kind sweeps and worker pools.
    pub const ALL: [AgentKind; 6] = [
        AgentKind::Ipa,
        AgentKind::Wba,
        AgentKind::Nga,
        AgentKind::OpenHands,
        AgentKind::Safety,
        AgentKind::External,
    ];

    /// Stable lowercase label used in queue keys and logs.
    pub fn label(&self) -> &'static str {
        match self {
            AgentKind::Ipa => "ipa",
            AgentKind::Wba => "wba",
            AgentKind::Nga => "nga",
            AgentKind::OpenHands => "openhands",
            AgentKind::Safety => "safety",
            AgentKind::External => "external",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A concrete agent instance: `kind` plus an instance discriminator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId {
    pub kind: AgentKind,
    pub instance: String,
}

impl AgentId {
    pub fn new(kind: AgentKind, instance: impl Into<String>) -> Self {
        Self { kind, instance: instance.into() }
    }

    /// Stable key grouping this instance's failures for the circuit breaker.
    pub fn breaker_key(&self) -> String {
        format!("{}:{}", self.kind.label(), self.instance)
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind.label(), self.instance)
    }
}

/// Message kinds carried by an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Request,
    Reply,
    Error,
    Event,
}

/// Dequeue priority. Higher preempts lower across sessions; FIFO within one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    /// Strict dequeue order.
    pub const ORDERED: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    pub fn label(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

/// Workflow stages a turn moves through. Also used to tag safety checks and
/// error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    PreSafety,
    Ipa,
    Wba,
    Nga,
    PostSafety,
    Done,
    Failed,
}

impl Stage {
    /// The agent kind a pipeline stage dispatches to, if any.
    pub fn agent_kind(&self) -> Option<AgentKind> {
        match self {
            Stage::Ipa => Some(AgentKind::Ipa),
            Stage::Wba => Some(AgentKind::Wba),
            Stage::Nga => Some(AgentKind::Nga),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::PreSafety => "pre_safety",
            Stage::Ipa => "ipa",
            Stage::Wba => "wba",
            Stage::Nga => "nga",
            Stage::PostSafety => "post_safety",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// The unit of transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub session_id: String,
    pub from: AgentId,
    pub to: AgentId,
    pub kind: MessageKind,
    pub priority: Priority,
    pub payload: Vec<u8>,
    /// Echoes the id of the originating request on any reply or error.
    pub correlation_id: Option<Uuid>,
    /// Delivery attempt, starting at 1. Incremented on tail requeue and on
    /// reservation reclaim.
    pub attempt: u32,
    /// Absolute wall-clock deadline; past it the envelope is dead-lettered.
    pub deadline: SystemTime,
    pub enqueued_at: Option<SystemTime>,
    pub dequeued_at: Option<SystemTime>,
    pub acked_at: Option<SystemTime>,
}

impl Envelope {
    /// Build a request envelope with a fresh id.
    pub fn request(
        session_id: impl Into<String>,
        from: AgentId,
        to: AgentId,
        payload: Vec<u8>,
        priority: Priority,
        deadline: SystemTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.into(),
            from,
            to,
            kind: MessageKind::Request,
            priority,
            payload,
            correlation_id: None,
            attempt: 1,
            deadline,
            enqueued_at: None,
            dequeued_at: None,
            acked_at: None,
        }
    }

    /// Build the reply to a request, echoing its correlation id, session,
    /// priority, and deadline, routed back at the requester.
    pub fn reply_to(request: &Envelope, from: AgentId, payload: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: request.session_id.clone(),
            from,
            to: request.from.clone(),
            kind: MessageKind::Reply,
            priority: request.priority,
            payload,
            correlation_id: Some(request.id),
            attempt: 1,
            deadline: request.deadline,
            enqueued_at: None,
            dequeued_at: None,
            acked_at: None,
        }
    }

    /// Build an error envelope correlated with a request.
    pub fn error_to(request: &Envelope, from: AgentId, payload: Vec<u8>) -> Self {
        let mut env = Self::reply_to(request, from, payload);
        env.kind = MessageKind::Error;
        env
    }

    /// Remaining time until the deadline, if any.
    pub fn remaining(&self, now: SystemTime) -> Option<Duration> {
        self.deadline.duration_since(now).ok()
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.remaining(now).is_none()
    }

    /// Serialize to the versioned wire form.
    pub fn encode(&self) -> Result<Vec<u8>, CoreError> {
        if self.payload.len() > MAX_PAYLOAD_BYTES {
            return Err(CoreError::Protocol {
                detail: format!(
                    "payload of {} bytes exceeds the {} byte bound",
                    self.payload.len(),
                    MAX_PAYLOAD_BYTES
                ),
            });
        }
        let body = serde_json::to_vec(self)
            .map_err(|e| CoreError::Protocol { detail: format!("encode: {e}") })?;
        let mut out = Vec::with_capacity(body.len() + 1);
        out.push(FORMAT_VERSION);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode the versioned wire form, rejecting unknown versions.
    pub fn decode(bytes: &[u8]) -> Result<Self, CoreError> {
        let (&version, body) = bytes
            .split_first()
            .ok_or_else(|| CoreError::Protocol { detail: "empty envelope".into() })?;
        if version != FORMAT_VERSION {
            return Err(CoreError::Protocol {
                detail: format!("unsupported format version {version}"),
            });
        }
        serde_json::from_slice(body)
            .map_err(|e| CoreError::Protocol { detail: format!("decode: {e}") })
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
