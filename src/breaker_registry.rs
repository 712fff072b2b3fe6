//! Registry for the per-key circuit breakers.
//!
//! Breaker state is process-local and shared among all callers of the same
//! breaker key. The registry hands out clones of one shared breaker per key
//! and exposes a snapshot for the health monitor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::breaker::{BreakerSnapshot, CircuitBreaker};
use crate::config::BreakerConfig;
use crate::telemetry::EventBus;

/// Registry keyed by breaker key.
#[derive(Clone)]
pub struct BreakerRegistry {
    inner: Arc<Mutex<HashMap<String, CircuitBreaker>>>,
    config: BreakerConfig,
    events: EventBus,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig, events: EventBus) -> Self {
        Self { inner: Arc::new(Mutex::new(HashMap::new())), config, events }
    }

    /// Shared breaker for `key`, created on first use.
    pub fn get_or_create(&self, key: &str) -> CircuitBreaker {
        let mut map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        map.entry(key.to_string())
            .or_insert_with(|| {
                CircuitBreaker::new(key, self.config.clone(), self.events.clone())
            })
            .clone()
    }

    /// Breaker for `key`, if one has been created.
    pub fn get(&self, key: &str) -> Option<CircuitBreaker> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).get(key).cloned()
    }

    /// Reset a breaker by key. Admin-only. Errors if the key is unknown.
    pub fn reset(&self, key: &str) -> Result<(), String> {
        match self.get(key) {
            Some(breaker) => {
                breaker.reset();
                Ok(())
            }
            None => Err(format!("breaker key not found: {key}")),
        }
    }

    /// Snapshot of all breakers, sorted by key.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut entries: Vec<BreakerSnapshot> = map.values().map(|b| b.snapshot()).collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitState;

    fn registry() -> BreakerRegistry {
        BreakerRegistry::new(BreakerConfig::default(), EventBus::disabled())
    }

    #[test]
    fn get_or_create_returns_the_same_shared_breaker() {
        let registry = registry();
        let a = registry.get_or_create("ipa:ipa-0");
        let b = registry.get_or_create("ipa:ipa-0");

        a.try_acquire().expect("closed").record(false);
        assert_eq!(b.snapshot().consecutive_failures, 1, "state is shared");
    }

    #[test]
    fn snapshot_is_sorted_by_key() {
        let registry = registry();
        registry.get_or_create("wba:wba-0");
        registry.get_or_create("ipa:ipa-0");

        let keys: Vec<String> = registry.snapshot().into_iter().map(|s| s.key).collect();
        assert_eq!(keys, vec!["ipa:ipa-0".to_string(), "wba:wba-0".to_string()]);
    }

    #[test]
    fn reset_by_key() {
        let registry = registry();
        let breaker = registry.get_or_create("nga:nga-0");
        for _ in 0..5 {
            breaker.try_acquire().expect("closed").record(false);
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        registry.reset("nga:nga-0").expect("known key");
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(registry.reset("missing").is_err());
    }
}
