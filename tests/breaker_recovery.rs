//! Breaker behavior across turns: tripping, fast-fail, and probe recovery.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use turnloom::{
    AgentId, AgentKind, AgentRegistry, CoreConfig, CoreError, EventBus, InMemoryQueue,
    MessageCoordinator, MockTransport, RetryConfig, SafetyGate, Stage, TurnStatus,
    WorkflowManager,
};

fn breaker_config() -> CoreConfig {
    let mut config = CoreConfig::default();
    // One transport attempt and one delivery per dispatch keeps the
    // failure arithmetic exact: one workflow dispatch = one breaker outcome.
    config.retry = RetryConfig {
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(10),
        multiplier: 2.0,
        jitter_max: Duration::ZERO,
        max_attempts: 1,
    };
    config.queue.max_delivery_attempts = 1;
    config.coordinator.poll_interval = Duration::from_millis(5);
    config.breaker.failure_threshold = 2;
    config.breaker.open_duration = Duration::from_secs(1);
    config.breaker.success_threshold = 2;
    config
}

struct Stack {
    workflow: WorkflowManager,
    coordinator: Arc<MessageCoordinator>,
    transport: Arc<MockTransport>,
    cancel: CancellationToken,
}

fn stack() -> Stack {
    let config = breaker_config();
    let events = EventBus::disabled();
    let queue = Arc::new(InMemoryQueue::new(config.queue.clone(), events.clone()));
    let registry = Arc::new(AgentRegistry::new(config.registry.clone(), events.clone()));
    let transport = Arc::new(MockTransport::new());
    let coordinator = Arc::new(MessageCoordinator::new(
        queue,
        registry.clone(),
        transport.clone(),
        &config,
        events.clone(),
    ));
    coordinator.start(&[AgentKind::Ipa, AgentKind::Wba, AgentKind::Nga]);

    for kind in [AgentKind::Ipa, AgentKind::Wba, AgentKind::Nga] {
        let id = AgentId::new(kind, format!("{kind}-0"));
        registry.register(id.clone(), HashSet::new());
        registry.heartbeat(&id).unwrap();
    }

    let workflow =
        WorkflowManager::new(coordinator.clone(), SafetyGate::permissive(), &config, events);
    Stack { workflow, coordinator, transport, cancel: CancellationToken::new() }
}

async fn run_turn(stack: &Stack, session: &str) -> turnloom::TurnResult {
    stack
        .workflow
        .run_turn_with_deadline(session, "hello", Duration::from_secs(5), &stack.cancel)
        .await
}

#[tokio::test]
async fn tripped_breaker_fast_fails_turns_then_admits_one_probe() {
    let stack = stack();
    stack.transport.static_reply(AgentKind::Ipa, "ipa-ok");
    stack.transport.static_reply(AgentKind::Nga, "nga-ok");
    stack.transport.fail_then_reply(
        AgentKind::Wba,
        u32::MAX,
        CoreError::Transport { detail: "wba down".into() },
        "",
    );

    // Turn 1: the stage dispatch and its workflow-level retry both fail,
    // which is exactly the failure threshold. The breaker is now open.
    let result = run_turn(&stack, "sess-1").await;
    assert_eq!(result.terminal_status, TurnStatus::Failed);
    assert_eq!(result.error.unwrap().stage, Some(Stage::Wba));
    let calls_when_tripped = stack.transport.calls(AgentKind::Wba);
    assert_eq!(calls_when_tripped, 2);

    // Turn 2: fast-failed by the breaker without touching the backend.
    let result = run_turn(&stack, "sess-2").await;
    assert_eq!(result.terminal_status, TurnStatus::Failed);
    let error = result.error.unwrap();
    assert_eq!(error.code, "circuit_open");
    assert_eq!(error.stage, Some(Stage::Wba));
    assert_eq!(
        stack.transport.calls(AgentKind::Wba),
        calls_when_tripped,
        "open breaker must not invoke the backend"
    );

    // Recovery window elapses and the backend comes back.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    stack.transport.static_reply(AgentKind::Wba, "wba-ok"); // resets the call counter

    // Turn 3: exactly one probe is admitted and it succeeds end to end.
    let result = run_turn(&stack, "sess-3").await;
    assert_eq!(result.terminal_status, TurnStatus::Done);
    assert_eq!(stack.transport.calls(AgentKind::Wba), 1, "one probe through the half-open gate");

    stack.coordinator.shutdown().await;
}

#[tokio::test]
async fn breaker_failure_is_isolated_per_agent_kind() {
    let stack = stack();
    stack.transport.static_reply(AgentKind::Ipa, "ipa-ok");
    stack.transport.static_reply(AgentKind::Nga, "nga-ok");
    stack.transport.fail_then_reply(
        AgentKind::Wba,
        u32::MAX,
        CoreError::Transport { detail: "wba down".into() },
        "",
    );

    let _ = run_turn(&stack, "sess-1").await; // trips the wba breaker

    // A healthy upstream still answers: the ipa breaker is untouched.
    let result = run_turn(&stack, "sess-2").await;
    assert_eq!(result.error.unwrap().stage, Some(Stage::Wba));
    assert_eq!(stack.transport.requests_for(AgentKind::Ipa).len(), 2);

    stack.coordinator.shutdown().await;
}
