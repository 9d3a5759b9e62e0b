//! One breaker per external dependency.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::{BreakerStatus, CircuitBreaker};

/// Owns the breakers of a process, keyed by dependency name.
///
/// This is where operators reset a `Damaged` breaker after fixing the
/// underlying problem (new credentials, reachable host).
pub struct BreakerRegistry {
    default_backoff: Duration,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    /// Create a registry whose breakers use `default_backoff`.
    pub fn new(default_backoff: Duration) -> Self {
        Self {
            default_backoff,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Get the breaker for `name`, creating it with the default backoff.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create_with(name, self.default_backoff)
    }

    /// Get the breaker for `name`, creating it with `backoff`.
    ///
    /// An existing breaker keeps its original backoff.
    pub fn get_or_create_with(&self, name: &str, backoff: Duration) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        Arc::clone(
            breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name, backoff))),
        )
    }

    /// Get an existing breaker.
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.lock().get(name).cloned()
    }

    /// Reset one breaker. Returns false if no breaker has that name.
    pub fn reset(&self, name: &str) -> bool {
        match self.get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Reset every breaker.
    pub fn reset_all(&self) {
        let breakers: Vec<_> = self.breakers.lock().values().cloned().collect();
        for breaker in breakers {
            breaker.reset();
        }
    }

    /// Status of every breaker, sorted by name.
    pub fn snapshot(&self) -> Vec<BreakerStatus> {
        let breakers: Vec<_> = self.breakers.lock().values().cloned().collect();
        let mut statuses: Vec<_> = breakers.iter().map(|b| b.status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Number of breakers.
    pub fn len(&self) -> usize {
        self.breakers.lock().len()
    }

    /// Whether the registry has no breakers.
    pub fn is_empty(&self) -> bool {
        self.breakers.lock().is_empty()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}
