//! Safety gate: policy enforcement before and after the agent pipeline.
//!
//! The policy itself is an external capability; the gate only enforces the
//! call timeout and the configured fail mode. The default is fail-closed:
//! a policy that cannot answer in time blocks the content.

use crate::config::{SafetyConfig, SafetyFailMode};
use crate::envelope::Stage;
use crate::error::CoreError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What the policy decided about one piece of content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyVerdict {
    Allow,
    /// Substitute the payload and continue.
    Rewrite(Vec<u8>),
    /// Stop the turn. The reason is the user-visible message.
    Block { reason: String },
}

/// One content check handed to the policy.
#[derive(Debug, Clone)]
pub struct SafetyRequest {
    pub session_id: String,
    pub stage: Stage,
    pub payload: Vec<u8>,
}

/// External safety-policy capability.
#[async_trait]
pub trait SafetyPolicy: Send + Sync {
    async fn review(&self, request: SafetyRequest) -> SafetyVerdict;
}

/// Policy that allows everything. Useful as a default in tests.
pub struct AllowAllPolicy;

#[async_trait]
impl SafetyPolicy for AllowAllPolicy {
    async fn review(&self, _request: SafetyRequest) -> SafetyVerdict {
        SafetyVerdict::Allow
    }
}

/// Gate wrapping the policy with timeout and fail-mode handling.
pub struct SafetyGate {
    policy: Arc<dyn SafetyPolicy>,
    config: SafetyConfig,
}

impl SafetyGate {
    pub fn new(policy: Arc<dyn SafetyPolicy>, config: SafetyConfig) -> Self {
        Self { policy, config }
    }

    /// Allow everything; for deployments that gate elsewhere and for tests.
    pub fn permissive() -> Self {
        Self::new(Arc::new(AllowAllPolicy), SafetyConfig::default())
    }

    /// Check one payload at one stage. Only cancellation produces an error;
    /// timeouts resolve through the configured fail mode.
    pub async fn check(
        &self,
        session_id: &str,
        stage: Stage,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> Result<SafetyVerdict, CoreError> {
        let request = SafetyRequest {
            session_id: session_id.to_string(),
            stage,
            payload: payload.to_vec(),
        };

        let review = self.policy.review(request);
        tokio::select! {
            _ = cancel.cancelled() => Err(CoreError::Cancelled),
            outcome = tokio::time::timeout(self.config.policy_timeout, review) => {
                match outcome {
                    Ok(verdict) => Ok(verdict),
                    Err(_) => Ok(self.on_timeout(stage)),
                }
            }
        }
    }

    fn on_timeout(&self, stage: Stage) -> SafetyVerdict {
        match self.config.fail_mode {
            SafetyFailMode::FailClosed => {
                tracing::warn!(%stage, "safety policy timed out, blocking (fail-closed)");
                SafetyVerdict::Block { reason: "content review is unavailable right now".into() }
            }
            SafetyFailMode::FailOpen => {
                tracing::warn!(%stage, "safety policy timed out, allowing (fail-open)");
                SafetyVerdict::Allow
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Scripted policy keyed on payload contents.
    struct KeywordPolicy;

    #[async_trait]
    impl SafetyPolicy for KeywordPolicy {
        async fn review(&self, request: SafetyRequest) -> SafetyVerdict {
            if request.payload == b"unsafe" {
                SafetyVerdict::Rewrite(b"sanitized".to_vec())
            } else if request.payload == b"harmful" {
                SafetyVerdict::Block { reason: "let's steer the story another way".into() }
            } else {
                SafetyVerdict::Allow
            }
        }
    }

    struct StalledPolicy;

    #[async_trait]
    impl SafetyPolicy for StalledPolicy {
        async fn review(&self, _request: SafetyRequest) -> SafetyVerdict {
            tokio::time::sleep(Duration::from_secs(60)).await;
            SafetyVerdict::Allow
        }
    }

    fn gate_with(policy: impl SafetyPolicy + 'static, fail_mode: SafetyFailMode) -> SafetyGate {
        SafetyGate::new(
            Arc::new(policy),
            SafetyConfig { policy_timeout: Duration::from_millis(50), fail_mode },
        )
    }

    #[tokio::test]
    async fn verdicts_pass_through() {
        let gate = gate_with(KeywordPolicy, SafetyFailMode::FailClosed);
        let cancel = CancellationToken::new();

        let allow = gate.check("s", Stage::PreSafety, b"hello", &cancel).await.unwrap();
        assert_eq!(allow, SafetyVerdict::Allow);

        let rewrite = gate.check("s", Stage::PreSafety, b"unsafe", &cancel).await.unwrap();
        assert_eq!(rewrite, SafetyVerdict::Rewrite(b"sanitized".to_vec()));

        let block = gate.check("s", Stage::PostSafety, b"harmful", &cancel).await.unwrap();
        assert!(matches!(block, SafetyVerdict::Block { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_blocks_when_fail_closed() {
        let gate = gate_with(StalledPolicy, SafetyFailMode::FailClosed);
        let verdict =
            gate.check("s", Stage::PreSafety, b"x", &CancellationToken::new()).await.unwrap();
        assert!(matches!(verdict, SafetyVerdict::Block { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_allows_when_fail_open() {
        let gate = gate_with(StalledPolicy, SafetyFailMode::FailOpen);
        let verdict =
            gate.check("s", Stage::PreSafety, b"x", &CancellationToken::new()).await.unwrap();
        assert_eq!(verdict, SafetyVerdict::Allow);
    }

    #[tokio::test]
    async fn cancellation_wins_over_the_policy() {
        let gate = gate_with(StalledPolicy, SafetyFailMode::FailClosed);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = gate.check("s", Stage::PreSafety, b"x", &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
