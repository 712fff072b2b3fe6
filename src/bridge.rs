//! Protocol bridge: the uniform send/receive façade over agent backends.
//!
//! The coordinator is variant-agnostic: [`ConnectorTransport`] dispatches to
//! registered per-instance endpoints, [`MockTransport`] replays scripted
//! responses for tests. Both enforce the caller's timeout and surface the
//! same error taxonomy, so swapping them never changes calling code.

use crate::envelope::{AgentId, AgentKind, Envelope, MessageKind};
use crate::error::CoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// One agent instance's endpoint: takes a request, produces the reply.
#[async_trait]
pub trait AgentConnector: Send + Sync {
    async fn handle(&self, env: Envelope) -> Result<Envelope, CoreError>;
}

/// Uniform dispatch façade the coordinator calls.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Deliver `env` to the instance `to` and wait for the correlated reply,
    /// up to `timeout`. A timeout is a transport failure (retryable); a reply
    /// that does not correlate is a protocol failure (fatal).
    async fn send(
        &self,
        to: &AgentId,
        env: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, CoreError>;
}

fn validate_reply(request_id: uuid::Uuid, reply: Envelope) -> Result<Envelope, CoreError> {
    if !matches!(reply.kind, MessageKind::Reply | MessageKind::Error) {
        return Err(CoreError::Protocol {
            detail: format!("backend answered with {:?}, expected a reply", reply.kind),
        });
    }
    if reply.correlation_id != Some(request_id) {
        return Err(CoreError::Protocol {
            detail: "reply does not correlate with the request".into(),
        });
    }
    Ok(reply)
}

/// Production transport: a registry of live connectors keyed by instance.
#[derive(Default)]
pub struct ConnectorTransport {
    connectors: RwLock<HashMap<AgentId, Arc<dyn AgentConnector>>>,
}

impl ConnectorTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, id: AgentId, connector: Arc<dyn AgentConnector>) {
        self.connectors
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, connector);
    }

    pub fn detach(&self, id: &AgentId) {
        self.connectors.write().unwrap_or_else(|poisoned| poisoned.into_inner()).remove(id);
    }
}

#[async_trait]
impl AgentTransport for ConnectorTransport {
    async fn send(
        &self,
        to: &AgentId,
        env: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, CoreError> {
        let connector = self
            .connectors
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(to)
            .cloned()
            .ok_or(CoreError::UnknownAgent { kind: to.kind })?;

        let request_id = env.id;
        match tokio::time::timeout(timeout, connector.handle(env)).await {
            Ok(Ok(reply)) => validate_reply(request_id, reply),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CoreError::Transport {
                detail: format!("no reply from {to} within {timeout:?}"),
            }),
        }
    }
}

/// Scripted behavior for one agent kind under the mock transport.
enum MockBehavior {
    /// Answer every request with this payload.
    Reply { payload: Vec<u8> },
    /// Answer every request with its own payload.
    Echo,
    /// Fail the first `failures` calls with clones of `error`, then reply.
    FailThenReply { failures: u32, error: CoreError, payload: Vec<u8> },
    /// Sleep before replying; pairs with short timeouts in deadline tests.
    DelayedReply { delay: Duration, payload: Vec<u8> },
}

struct MockScript {
    behavior: MockBehavior,
    calls: u32,
}

/// Deterministic transport for tests: per-kind scripts plus a log of every
/// request it observed.
#[derive(Default)]
pub struct MockTransport {
    scripts: Mutex<HashMap<AgentKind, MockScript>>,
    observed: Mutex<Vec<Envelope>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self, kind: AgentKind, behavior: MockBehavior) {
        self.scripts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(kind, MockScript { behavior, calls: 0 });
    }

    /// Answer every request to `kind` with a static payload.
    pub fn static_reply(&self, kind: AgentKind, payload: impl Into<Vec<u8>>) {
        self.script(kind, MockBehavior::Reply { payload: payload.into() });
    }

    /// Answer every request to `kind` by echoing its payload.
    pub fn echo(&self, kind: AgentKind) {
        self.script(kind, MockBehavior::Echo);
    }

    /// Fail the first `failures` requests to `kind`, then reply.
    /// `u32::MAX` fails forever.
    pub fn fail_then_reply(
        &self,
        kind: AgentKind,
        failures: u32,
        error: CoreError,
        payload: impl Into<Vec<u8>>,
    ) {
        self.script(kind, MockBehavior::FailThenReply { failures, error, payload: payload.into() });
    }

    /// Sleep `delay` before every reply from `kind`.
    pub fn delayed_reply(&self, kind: AgentKind, delay: Duration, payload: impl Into<Vec<u8>>) {
        self.script(kind, MockBehavior::DelayedReply { delay, payload: payload.into() });
    }

    /// Every request observed, in arrival order.
    pub fn observed_requests(&self) -> Vec<Envelope> {
        self.observed.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    /// Requests observed for one kind.
    pub fn requests_for(&self, kind: AgentKind) -> Vec<Envelope> {
        self.observed_requests().into_iter().filter(|e| e.to.kind == kind).collect()
    }

    /// How many calls reached the scripted backend for `kind`.
    pub fn calls(&self, kind: AgentKind) -> u32 {
        self.scripts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&kind)
            .map(|s| s.calls)
            .unwrap_or(0)
    }
}

#[async_trait]
impl AgentTransport for MockTransport {
    async fn send(
        &self,
        to: &AgentId,
        env: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, CoreError> {
        let request_id = env.id;
        self.observed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(env.clone());

        // Decide the outcome under the lock, sleep outside it.
        let (delay, outcome) = {
            let mut scripts =
                self.scripts.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let script = scripts
                .get_mut(&to.kind)
                .ok_or(CoreError::UnknownAgent { kind: to.kind })?;
            let call = script.calls;
            script.calls += 1;
            match &script.behavior {
                MockBehavior::Reply { payload } => {
                    (Duration::ZERO, Ok(Envelope::reply_to(&env, to.clone(), payload.clone())))
                }
                MockBehavior::Echo => {
                    let payload = env.payload.clone();
                    (Duration::ZERO, Ok(Envelope::reply_to(&env, to.clone(), payload)))
                }
                MockBehavior::FailThenReply { failures, error, payload } => {
                    if call < *failures {
                        (Duration::ZERO, Err(error.clone()))
                    } else {
                        (
                            Duration::ZERO,
                            Ok(Envelope::reply_to(&env, to.clone(), payload.clone())),
                        )
                    }
                }
                MockBehavior::DelayedReply { delay, payload } => {
                    (*delay, Ok(Envelope::reply_to(&env, to.clone(), payload.clone())))
                }
            }
        };

        if delay >= timeout && !delay.is_zero() {
            tokio::time::sleep(timeout).await;
            return Err(CoreError::Transport {
                detail: format!("no reply from {to} within {timeout:?}"),
            });
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        outcome.and_then(|reply| validate_reply(request_id, reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Priority;
    use std::time::SystemTime;

    fn request(to_kind: AgentKind) -> Envelope {
        Envelope::request(
            "sess",
            AgentId::new(AgentKind::External, "front"),
            AgentId::new(to_kind, "inst-0"),
            b"in".to_vec(),
            Priority::Normal,
            SystemTime::now() + Duration::from_secs(30),
        )
    }

    struct Echo;

    #[async_trait]
    impl AgentConnector for Echo {
        async fn handle(&self, env: Envelope) -> Result<Envelope, CoreError> {
            let from = env.to.clone();
            let payload = env.payload.clone();
            Ok(Envelope::reply_to(&env, from, payload))
        }
    }

    struct Stuck;

    #[async_trait]
    impl AgentConnector for Stuck {
        async fn handle(&self, env: Envelope) -> Result<Envelope, CoreError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            let from = env.to.clone();
            Ok(Envelope::reply_to(&env, from, Vec::new()))
        }
    }

    struct Miscorrelating;

    #[async_trait]
    impl AgentConnector for Miscorrelating {
        async fn handle(&self, env: Envelope) -> Result<Envelope, CoreError> {
            let from = env.to.clone();
            let mut reply = Envelope::reply_to(&env, from, Vec::new());
            reply.correlation_id = Some(uuid::Uuid::new_v4());
            Ok(reply)
        }
    }

    #[tokio::test]
    async fn connector_transport_round_trips() {
        let transport = ConnectorTransport::new();
        let id = AgentId::new(AgentKind::Ipa, "inst-0");
        transport.attach(id.clone(), Arc::new(Echo));

        let env = request(AgentKind::Ipa);
        let reply = transport.send(&id, env.clone(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply.correlation_id, Some(env.id));
        assert_eq!(reply.payload, b"in");
    }

    #[tokio::test]
    async fn missing_connector_is_unknown_agent() {
        let transport = ConnectorTransport::new();
        let id = AgentId::new(AgentKind::Wba, "nowhere");
        let err = transport.send(&id, request(AgentKind::Wba), Duration::from_secs(1)).await;
        assert!(matches!(err.unwrap_err(), CoreError::UnknownAgent { kind: AgentKind::Wba }));
    }

    #[tokio::test(start_paused = true)]
    async fn connector_timeout_is_a_transport_error() {
        let transport = ConnectorTransport::new();
        let id = AgentId::new(AgentKind::Nga, "slow");
        transport.attach(id.clone(), Arc::new(Stuck));

        let err = transport
            .send(&id, request(AgentKind::Nga), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn miscorrelated_reply_is_a_protocol_error() {
        let transport = ConnectorTransport::new();
        let id = AgentId::new(AgentKind::Ipa, "broken");
        transport.attach(id.clone(), Arc::new(Miscorrelating));

        let err = transport
            .send(&id, request(AgentKind::Ipa), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_protocol());
    }

    #[tokio::test]
    async fn mock_replies_and_records() {
        let mock = MockTransport::new();
        mock.static_reply(AgentKind::Ipa, "ipa-ok");

        let id = AgentId::new(AgentKind::Ipa, "inst-0");
        let env = request(AgentKind::Ipa);
        let reply = mock.send(&id, env.clone(), Duration::from_secs(1)).await.unwrap();

        assert_eq!(reply.payload, b"ipa-ok");
        assert_eq!(reply.correlation_id, Some(env.id));
        assert_eq!(mock.requests_for(AgentKind::Ipa).len(), 1);
        assert_eq!(mock.calls(AgentKind::Ipa), 1);
    }

    #[tokio::test]
    async fn mock_fails_then_recovers() {
        let mock = MockTransport::new();
        mock.fail_then_reply(
            AgentKind::Wba,
            2,
            CoreError::Transport { detail: "down".into() },
            "wba-ok",
        );

        let id = AgentId::new(AgentKind::Wba, "inst-0");
        for _ in 0..2 {
            let err =
                mock.send(&id, request(AgentKind::Wba), Duration::from_secs(1)).await.unwrap_err();
            assert!(err.is_transport());
        }
        let reply = mock.send(&id, request(AgentKind::Wba), Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply.payload, b"wba-ok");
    }

    #[tokio::test(start_paused = true)]
    async fn mock_delay_past_the_timeout_is_a_transport_error() {
        let mock = MockTransport::new();
        mock.delayed_reply(AgentKind::Wba, Duration::from_millis(500), "late");

        let id = AgentId::new(AgentKind::Wba, "inst-0");
        let err = mock
            .send(&id, request(AgentKind::Wba), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }
}
