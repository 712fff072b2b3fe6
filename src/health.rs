//! Health monitor: read-only aggregation of everything observable.
//!
//! Collects registry statuses, breaker snapshots, queue depths and ages, and
//! turn statistics into one consistent snapshot. Alert thresholds are
//! configured, but the monitor never takes corrective action; it reports.

use crate::breaker::BreakerSnapshot;
use crate::breaker_registry::BreakerRegistry;
use crate::config::HealthConfig;
use crate::envelope::{AgentId, AgentKind, Stage};
use crate::queue::{MessageQueue, QueueDepths};
use crate::registry::{AgentRegistry, AgentStatus};
use crate::telemetry::{CoreEvent, EventBus, HealthEvent};
use crate::workflow::TurnStatus;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Bounded-window accumulator for turn outcomes and stage latencies.
///
/// Shared between the workflow manager (writer) and the health monitor
/// (reader).
pub struct TurnStats {
    inner: Mutex<TurnStatsInner>,
    window: usize,
}

struct TurnStatsInner {
    turns_total: u64,
    turns_done: u64,
    turns_cancelled: u64,
    latencies: HashMap<Stage, VecDeque<Duration>>,
}

impl TurnStats {
    pub fn new(window: usize) -> Self {
        Self {
            inner: Mutex::new(TurnStatsInner {
                turns_total: 0,
                turns_done: 0,
                turns_cancelled: 0,
                latencies: HashMap::new(),
            }),
            window: window.max(1),
        }
    }

    pub fn record(&self, status: TurnStatus, stage_latencies: &[(Stage, Duration)]) {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.turns_total += 1;
        match status {
            TurnStatus::Done => inner.turns_done += 1,
            TurnStatus::Cancelled => inner.turns_cancelled += 1,
            TurnStatus::Failed => {}
        }
        for (stage, latency) in stage_latencies {
            let samples = inner.latencies.entry(*stage).or_default();
            if samples.len() >= self.window {
                samples.pop_front();
            }
            samples.push_back(*latency);
        }
    }

    pub fn snapshot(&self) -> TurnStatsSnapshot {
        let inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut stages: Vec<StageLatencySummary> = inner
            .latencies
            .iter()
            .map(|(stage, samples)| {
                let mut sorted: Vec<Duration> = samples.iter().copied().collect();
                sorted.sort_unstable();
                StageLatencySummary {
                    stage: *stage,
                    p50: percentile(&sorted, 0.50),
                    p95: percentile(&sorted, 0.95),
                    p99: percentile(&sorted, 0.99),
                }
            })
            .collect();
        stages.sort_by_key(|s| format!("{}", s.stage));
        TurnStatsSnapshot {
            turns_total: inner.turns_total,
            turns_done: inner.turns_done,
            turns_cancelled: inner.turns_cancelled,
            success_rate: if inner.turns_total == 0 {
                1.0
            } else {
                inner.turns_done as f64 / inner.turns_total as f64
            },
            stages,
        }
    }
}

/// Sorted-sample percentile: nearest-rank.
fn percentile(sorted: &[Duration], q: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let rank = ((sorted.len() as f64) * q).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Latency summary for one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageLatencySummary {
    pub stage: Stage,
    pub p50: Duration,
    pub p95: Duration,
    pub p99: Duration,
}

/// Aggregated turn statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnStatsSnapshot {
    pub turns_total: u64,
    pub turns_done: u64,
    pub turns_cancelled: u64,
    pub success_rate: f64,
    pub stages: Vec<StageLatencySummary>,
}

/// One kind's queue health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueHealth {
    pub kind: AgentKind,
    pub depths: QueueDepths,
    pub oldest_age: Option<Duration>,
}

/// The whole-system view the admin surface exposes.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub agents: Vec<(AgentId, AgentStatus)>,
    pub breakers: Vec<BreakerSnapshot>,
    pub queues: Vec<QueueHealth>,
    pub turns: TurnStatsSnapshot,
    /// Crossed alert thresholds, human-readable. Empty means quiet.
    pub alerts: Vec<String>,
}

/// Aggregates heartbeats, breaker states, and queue depths. Observation only.
pub struct HealthMonitor {
    registry: Arc<AgentRegistry>,
    breakers: BreakerRegistry,
    queue: Arc<dyn MessageQueue>,
    stats: Arc<TurnStats>,
    config: HealthConfig,
    events: EventBus,
    handle: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<AgentRegistry>,
        breakers: BreakerRegistry,
        queue: Arc<dyn MessageQueue>,
        stats: Arc<TurnStats>,
        config: HealthConfig,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            breakers,
            queue,
            stats,
            config,
            events,
            handle: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    /// Build a consistent snapshot of the whole core.
    pub async fn snapshot(&self) -> HealthSnapshot {
        let mut agents = self.registry.statuses();
        agents.sort_by(|(a, _), (b, _)| a.instance.cmp(&b.instance));
        let breakers = self.breakers.snapshot();

        let mut queues = Vec::with_capacity(AgentKind::ALL.len());
        for kind in AgentKind::ALL {
            let depths = self.queue.depths(kind).await.unwrap_or_default();
            let oldest_age = self.queue.oldest_age(kind).await.unwrap_or(None);
            queues.push(QueueHealth { kind, depths, oldest_age });
        }

        let mut alerts = Vec::new();
        for q in &queues {
            if let Some(age) = q.oldest_age {
                if age > self.config.max_oldest_age {
                    alerts.push(format!(
                        "oldest envelope for {} is {age:?} old (limit {:?})",
                        q.kind, self.config.max_oldest_age
                    ));
                }
            }
            if q.depths.dead_lettered > self.config.max_dlq_depth {
                alerts.push(format!(
                    "dead-letter queue for {} holds {} envelopes (limit {})",
                    q.kind, q.depths.dead_lettered, self.config.max_dlq_depth
                ));
            }
        }
        for b in &breakers {
            if let Some(open_for) = b.open_for {
                if open_for > self.config.max_breaker_open {
                    alerts.push(format!(
                        "breaker {} open for {open_for:?} (limit {:?})",
                        b.key, self.config.max_breaker_open
                    ));
                }
            }
        }

        HealthSnapshot { agents, breakers, queues, turns: self.stats.snapshot(), alerts }
    }

    /// Start the periodic reporter: sweeps the registry, snapshots, and emits
    /// tick/alert events on every interval.
    pub fn start(self: &Arc<Self>) {
        let monitor = self.clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(monitor.config.tick_interval) => {}
                }
                monitor.registry.sweep();
                let snapshot = monitor.snapshot().await;
                let queued: usize = snapshot.queues.iter().map(|q| q.depths.queued).sum();
                let open_breakers =
                    snapshot.breakers.iter().filter(|b| b.open_for.is_some()).count();
                let unhealthy_agents = snapshot
                    .agents
                    .iter()
                    .filter(|(_, status)| *status == AgentStatus::Unhealthy)
                    .count();
                monitor.events.emit(CoreEvent::Health(HealthEvent::Tick {
                    queued,
                    open_breakers,
                    unhealthy_agents,
                }));
                for alert in &snapshot.alerts {
                    tracing::warn!(alert, "health alert threshold crossed");
                    monitor
                        .events
                        .emit(CoreEvent::Health(HealthEvent::Alert { detail: alert.clone() }));
                }
            }
        });
        *self.handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle =
            self.handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
