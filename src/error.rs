//! Error taxonomy for the orchestration core.
//!
//! The taxonomy is fixed: components recover locally only for `Transport`
//! (via the retry harness) and `CircuitOpen` (via a bounded workflow-level
//! stage retry). Everything else propagates upward unchanged, gaining
//! stage/agent/attempt context at each boundary.

use crate::envelope::{AgentKind, Stage};
use std::fmt;
use std::time::Duration;

/// Unified error type for every core operation.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreError {
    /// I/O, connection reset, or timeout talking to the queue backend or an
    /// agent transport. Retryable.
    Transport { detail: String },
    /// A circuit breaker fast-failed the call without invoking the target.
    /// Retryable at the workflow level only.
    CircuitOpen { key: String, retry_after: Duration },
    /// A queue refused the envelope after waiting out the backpressure
    /// window. Retryable with back-pressure.
    Overloaded { kind: AgentKind, depth: usize },
    /// Stage or turn budget exhausted. Fatal to the current turn.
    DeadlineExceeded { stage: Option<Stage> },
    /// No healthy instance of the required kind. Fatal.
    UnknownAgent { kind: AgentKind },
    /// Schema or version mismatch. Fatal; the envelope is dead-lettered.
    Protocol { detail: String },
    /// The safety policy denied the content. Fatal, user-visible.
    SafetyBlocked { reason: String },
    /// The caller abandoned the operation. Terminal.
    Cancelled,
    /// The retry harness gave up. Wraps the last error it observed.
    RetriesExhausted { attempts: usize, last: Box<CoreError> },
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport { detail } => write!(f, "transport failure: {detail}"),
            Self::CircuitOpen { key, retry_after } => {
                write!(f, "circuit open for {key} (retry after {retry_after:?})")
            }
            Self::Overloaded { kind, depth } => {
                write!(f, "queue for {kind} overloaded ({depth} queued)")
            }
            Self::DeadlineExceeded { stage: Some(stage) } => {
                write!(f, "deadline exceeded in stage {stage}")
            }
            Self::DeadlineExceeded { stage: None } => write!(f, "deadline exceeded"),
            Self::UnknownAgent { kind } => write!(f, "no healthy {kind} agent registered"),
            Self::Protocol { detail } => write!(f, "protocol error: {detail}"),
            Self::SafetyBlocked { reason } => write!(f, "content blocked by safety policy: {reason}"),
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::RetriesExhausted { attempts, last } => {
                write!(f, "retries exhausted after {attempts} attempts, last error: {last}")
            }
        }
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::RetriesExhausted { last, .. } => Some(last.as_ref()),
            _ => None,
        }
    }
}

impl CoreError {
    /// Whether the retry harness may re-run the operation.
    ///
    /// `CircuitOpen` is deliberately non-retryable here: hammering an open
    /// breaker from inside the harness would defeat its fast-fail contract.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Overloaded { .. })
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_deadline(&self) -> bool {
        matches!(self, Self::DeadlineExceeded { .. })
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol { .. })
    }

    pub fn is_safety_blocked(&self) -> bool {
        matches!(self, Self::SafetyBlocked { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Unwrap `RetriesExhausted` layers down to the underlying error.
    pub fn root(&self) -> &CoreError {
        match self {
            Self::RetriesExhausted { last, .. } => last.root(),
            other => other,
        }
    }

    /// Stable wire code used in error envelopes and user-facing results.
    pub fn code(&self) -> &'static str {
        match self.root() {
            Self::Transport { .. } => "transport",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Overloaded { .. } => "overloaded",
            Self::DeadlineExceeded { .. } => "deadline_exceeded",
            Self::UnknownAgent { .. } => "unknown_agent",
            Self::Protocol { .. } => "protocol",
            Self::SafetyBlocked { .. } => "safety_blocked",
            Self::Cancelled => "cancelled",
            Self::RetriesExhausted { .. } => unreachable!("root() strips exhaustion wrappers"),
        }
    }

    /// Human-safe message for user-visible output. Never leaks internal
    /// identifiers; only the safety gate's own reason passes through.
    pub fn user_message(&self) -> String {
        match self.root() {
            Self::SafetyBlocked { reason } => reason.clone(),
            Self::DeadlineExceeded { .. } => "the story took too long to respond".into(),
            Self::Cancelled => "the turn was cancelled".into(),
            _ => "something went wrong processing this turn".into(),
        }
    }

    /// Serialize into the body of an error envelope.
    pub fn to_wire(&self) -> Vec<u8> {
        let root = self.root();
        let body = serde_json::json!({
            "code": root.code(),
            "message": root.to_string(),
            "retryable": root.is_retryable() || root.is_circuit_open(),
        });
        serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec())
    }

    /// Reconstruct a taxonomy variant from an error-envelope body. Unknown
    /// codes come back as `Protocol`, which is fatal and dead-letters.
    pub fn from_wire(bytes: &[u8]) -> CoreError {
        let body: serde_json::Value = match serde_json::from_slice(bytes) {
            Ok(v) => v,
            Err(e) => {
                return CoreError::Protocol { detail: format!("malformed error envelope: {e}") }
            }
        };
        let message = body["message"].as_str().unwrap_or_default().to_string();
        match body["code"].as_str().unwrap_or_default() {
            "transport" => CoreError::Transport { detail: message },
            "circuit_open" => {
                CoreError::CircuitOpen { key: message, retry_after: Duration::ZERO }
            }
            "overloaded" => CoreError::Overloaded { kind: AgentKind::External, depth: 0 },
            "deadline_exceeded" => CoreError::DeadlineExceeded { stage: None },
            "unknown_agent" => CoreError::UnknownAgent { kind: AgentKind::External },
            "safety_blocked" => CoreError::SafetyBlocked { reason: message },
            "cancelled" => CoreError::Cancelled,
            "protocol" => CoreError::Protocol { detail: message },
            other => CoreError::Protocol { detail: format!("unknown error code {other:?}") },
        }
    }
}
