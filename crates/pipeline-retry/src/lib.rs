// SPDX-License-Identifier: MIT OR Apache-2.0
//! Resilience primitives shared by every broker consumer and enrichment
//! provider: exponential backoff retrying and per-dependency circuit
//! breakers.
//!
//! A [`CircuitBreaker`] wraps a single named dependency (a broker
//! connection, an enrichment source, a rule store); a [`CircuitBreakerRegistry`]
//! holds one breaker per dependency name so a supervisor or metrics
//! exporter can enumerate and scrape every breaker's state without each
//! call site needing to know about the others.

mod backoff;
mod circuit_breaker;

pub use backoff::{retry_with_backoff, BackoffConfig, RetryError};
pub use circuit_breaker::{Admission, CircuitBreaker, CircuitBreakerConfig, State};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A registry of named circuit breakers, all sharing the same config.
///
/// Breakers are created lazily on first lookup so call sites don't need
/// to pre-register every dependency name up front (enrichment provider
/// names, for instance, come from rule configuration loaded at runtime).
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the breaker for `name`, creating it if this is the first
    /// time it's been referenced.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().expect("registry mutex poisoned");
        if let Some(existing) = breakers.get(name) {
            return Arc::clone(existing);
        }
        let breaker = Arc::new(CircuitBreaker::new(name, self.config));
        breakers.insert(name.to_string(), Arc::clone(&breaker));
        breaker
    }

    /// Snapshot every registered breaker's name and state, for metrics
    /// export.
    pub fn snapshot(&self) -> Vec<(String, State)> {
        let breakers = self.breakers.lock().expect("registry mutex poisoned");
        breakers
            .values()
            .map(|b| (b.name().to_string(), b.state()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_reuses_breaker_per_name() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
        let a = registry.get_or_create("mongo-enrichment");
        let b = registry.get_or_create("mongo-enrichment");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn registry_tracks_distinct_dependencies() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
        registry.get_or_create("redis-dedup");
        registry.get_or_create("postgres-filter-rules");
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|(_, s)| *s == State::Closed));
    }
}
