//! Agent registry: identities, capabilities, heartbeat-driven liveness.
//!
//! Reads are lock-free snapshots (`arc-swap`); writes are serialized behind a
//! mutex and publish a fresh snapshot. Health is derived from heartbeat age
//! against the configured thresholds, so a stalled agent degrades without any
//! writer touching it; the periodic sweep turns derived changes into events
//! and evicts the long-dead.

use crate::clock::{Clock, MonotonicClock};
use crate::config::RegistryConfig;
use crate::envelope::{AgentId, AgentKind};
use crate::error::CoreError;
use crate::telemetry::{CoreEvent, EventBus, RegistryEvent};
use arc_swap::ArcSwap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Agent liveness states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    /// Registered, no heartbeat seen yet.
    Registering,
    Healthy,
    Degraded,
    Unhealthy,
    /// Explicitly deregistered; evicted after the grace period.
    Shutdown,
}

/// One registered agent instance.
#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub identity: AgentId,
    pub capabilities: HashSet<String>,
    pub breaker_key: String,
    last_heartbeat_millis: Option<u64>,
    /// Status as last derived/emitted, so the sweep can detect transitions.
    reported: AgentStatus,
    /// When `reported` last changed, for eviction accounting.
    status_changed_millis: u64,
}

impl AgentRecord {
    /// Health derived from heartbeat age at `now`.
    fn derived(&self, now: u64, config: &RegistryConfig) -> AgentStatus {
        if self.reported == AgentStatus::Shutdown {
            return AgentStatus::Shutdown;
        }
        let Some(last) = self.last_heartbeat_millis else {
            return AgentStatus::Registering;
        };
        let silence = now.saturating_sub(last);
        if silence > config.unhealthy_threshold.as_millis() as u64 {
            AgentStatus::Unhealthy
        } else if silence > config.degraded_threshold.as_millis() as u64 {
            AgentStatus::Degraded
        } else {
            AgentStatus::Healthy
        }
    }
}

/// Process-wide map of agent identities.
pub struct AgentRegistry {
    snapshot: ArcSwap<HashMap<AgentId, AgentRecord>>,
    write_lock: Mutex<()>,
    config: RegistryConfig,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl AgentRegistry {
    pub fn new(config: RegistryConfig, events: EventBus) -> Self {
        Self::with_clock(config, events, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(config: RegistryConfig, events: EventBus, clock: Arc<dyn Clock>) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(HashMap::new()),
            write_lock: Mutex::new(()),
            config,
            clock,
            events,
        }
    }

    /// Serialize a mutation against the current snapshot and publish the
    /// result. Readers never block.
    fn mutate<R>(&self, f: impl FnOnce(&mut HashMap<AgentId, AgentRecord>) -> R) -> R {
        let _guard = self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut map = HashMap::clone(&self.snapshot.load());
        let result = f(&mut map);
        self.snapshot.store(Arc::new(map));
        result
    }

    pub fn register(&self, identity: AgentId, capabilities: HashSet<String>) {
        let now = self.clock.now_millis();
        let record = AgentRecord {
            breaker_key: identity.breaker_key(),
            identity: identity.clone(),
            capabilities,
            last_heartbeat_millis: None,
            reported: AgentStatus::Registering,
            status_changed_millis: now,
        };
        self.mutate(|map| {
            map.insert(identity.clone(), record);
        });
        tracing::info!(agent = %identity, "agent registered");
        self.events.emit(CoreEvent::Registry(RegistryEvent::Registered {
            kind: identity.kind,
            instance: identity.instance,
        }));
    }

    /// Record a liveness signal. Any heartbeat restores the agent to
    /// `Healthy`, including from `Unhealthy`.
    pub fn heartbeat(&self, identity: &AgentId) -> Result<(), CoreError> {
        let now = self.clock.now_millis();
        let previous = self.mutate(|map| {
            map.get_mut(identity).map(|record| {
                let previous = record.reported;
                record.last_heartbeat_millis = Some(now);
                if record.reported != AgentStatus::Shutdown {
                    record.reported = AgentStatus::Healthy;
                    if previous != AgentStatus::Healthy {
                        record.status_changed_millis = now;
                    }
                }
                previous
            })
        });

        match previous {
            None => Err(CoreError::UnknownAgent { kind: identity.kind }),
            Some(previous) => {
                if previous != AgentStatus::Healthy && previous != AgentStatus::Shutdown {
                    self.emit_status_change(identity, previous, AgentStatus::Healthy);
                }
                Ok(())
            }
        }
    }

    /// Explicit removal. The record lingers as `Shutdown` until the sweep
    /// evicts it after the grace period.
    pub fn deregister(&self, identity: &AgentId) {
        let now = self.clock.now_millis();
        let previous = self.mutate(|map| {
            map.get_mut(identity).map(|record| {
                let previous = record.reported;
                record.reported = AgentStatus::Shutdown;
                record.status_changed_millis = now;
                previous
            })
        });
        if let Some(previous) = previous {
            if previous != AgentStatus::Shutdown {
                self.emit_status_change(identity, previous, AgentStatus::Shutdown);
            }
        }
    }

    /// Identities of `kind` fit to serve traffic: `Healthy` first, then
    /// `Degraded`. Unhealthy, registering, and shut-down agents never appear.
    pub fn lookup(&self, kind: AgentKind) -> Vec<AgentId> {
        let now = self.clock.now_millis();
        let map = self.snapshot.load();
        let mut healthy = Vec::new();
        let mut degraded = Vec::new();
        for record in map.values().filter(|r| r.identity.kind == kind) {
            match record.derived(now, &self.config) {
                AgentStatus::Healthy => healthy.push(record.identity.clone()),
                AgentStatus::Degraded => degraded.push(record.identity.clone()),
                _ => {}
            }
        }
        healthy.sort_by(|a, b| a.instance.cmp(&b.instance));
        degraded.sort_by(|a, b| a.instance.cmp(&b.instance));
        healthy.extend(degraded);
        healthy
    }

    /// Pick an instance of `kind`, round-robin within the healthiest tier
    /// using the caller's cursor to spread load between callers.
    pub fn select(&self, kind: AgentKind, cursor: &AtomicUsize) -> Option<AgentId> {
        let now = self.clock.now_millis();
        let map = self.snapshot.load();
        let mut healthy = Vec::new();
        let mut degraded = Vec::new();
        for record in map.values().filter(|r| r.identity.kind == kind) {
            match record.derived(now, &self.config) {
                AgentStatus::Healthy => healthy.push(record.identity.clone()),
                AgentStatus::Degraded => degraded.push(record.identity.clone()),
                _ => {}
            }
        }
        let mut tier = if healthy.is_empty() { degraded } else { healthy };
        if tier.is_empty() {
            return None;
        }
        tier.sort_by(|a, b| a.instance.cmp(&b.instance));
        let index = cursor.fetch_add(1, Ordering::Relaxed) % tier.len();
        Some(tier.swap_remove(index))
    }

    pub fn capabilities(&self, identity: &AgentId) -> Option<HashSet<String>> {
        self.snapshot.load().get(identity).map(|r| r.capabilities.clone())
    }

    /// Derived health for one identity.
    pub fn health(&self, identity: &AgentId) -> Option<AgentStatus> {
        let now = self.clock.now_millis();
        self.snapshot.load().get(identity).map(|r| r.derived(now, &self.config))
    }

    /// Derived health for every registered agent, for the health monitor.
    pub fn statuses(&self) -> Vec<(AgentId, AgentStatus)> {
        let now = self.clock.now_millis();
        self.snapshot
            .load()
            .values()
            .map(|r| (r.identity.clone(), r.derived(now, &self.config)))
            .collect()
    }

    /// Turn derived status changes into events and evict the long-dead:
    /// `Shutdown` records past the grace period, and `Unhealthy` records
    /// whose silence exceeds the unhealthy threshold plus the grace period.
    pub fn sweep(&self) {
        let now = self.clock.now_millis();
        let grace = self.config.eviction_grace.as_millis() as u64;
        let unhealthy = self.config.unhealthy_threshold.as_millis() as u64;

        let mut transitions = Vec::new();
        let mut evicted = Vec::new();
        self.mutate(|map| {
            map.retain(|identity, record| {
                let derived = record.derived(now, &self.config);
                let keep = match derived {
                    AgentStatus::Shutdown => {
                        now.saturating_sub(record.status_changed_millis) <= grace
                    }
                    AgentStatus::Unhealthy => {
                        let silence =
                            now.saturating_sub(record.last_heartbeat_millis.unwrap_or(0));
                        silence <= unhealthy + grace
                    }
                    _ => true,
                };
                if !keep {
                    evicted.push(identity.clone());
                } else if derived != record.reported {
                    transitions.push((identity.clone(), record.reported, derived));
                    record.reported = derived;
                    record.status_changed_millis = now;
                }
                keep
            });
        });

        for (identity, from, to) in transitions {
            tracing::info!(agent = %identity, ?from, ?to, "agent status changed");
            self.emit_status_change(&identity, from, to);
        }
        for identity in evicted {
            tracing::info!(agent = %identity, "agent evicted");
            self.events.emit(CoreEvent::Registry(RegistryEvent::Evicted {
                kind: identity.kind,
                instance: identity.instance,
            }));
        }
    }

    fn emit_status_change(&self, identity: &AgentId, from: AgentStatus, to: AgentStatus) {
        self.events.emit(CoreEvent::Registry(RegistryEvent::StatusChanged {
            kind: identity.kind,
            instance: identity.instance.clone(),
            from,
            to,
        }));
    }
}
