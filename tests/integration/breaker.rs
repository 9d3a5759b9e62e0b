//! Circuit breaker integration tests.
//!
//! Drive breakers through the public API under a paused clock, the way a
//! listener and a health page would use them side by side.

use spoolkeeper::{BreakerError, BreakerFailure, BreakerRegistry, CircuitState};
use std::time::Duration;

const BACKOFF: Duration = Duration::from_secs(60);

async fn trip(registry: &BreakerRegistry, name: &str) {
    let breaker = registry.get_or_create(name);
    let result = breaker
        .execute(|_| async { Err::<(), _>(BreakerFailure::tripping("connection reset")) })
        .await;
    assert!(matches!(result, Err(BreakerError::Failed(_))));
}

#[tokio::test(start_paused = true)]
async fn test_trip_then_recover_after_backoff() {
    let registry = BreakerRegistry::new(BACKOFF);
    trip(&registry, "imap").await;

    let breaker = registry.get("imap").unwrap();
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(breaker.millis_until_retry() > 0);

    tokio::time::advance(Duration::from_millis(breaker.millis_until_retry())).await;
    breaker
        .execute(|circuit| async move {
            circuit.close_circuit();
            Ok::<_, BreakerFailure>(())
        })
        .await
        .unwrap();

    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.millis_until_retry(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_damaged_breaker_needs_registry_reset() {
    let registry = BreakerRegistry::new(BACKOFF);
    let breaker = registry.get_or_create("cloud-print");
    let _ = breaker
        .execute(|_| async { Err::<(), _>(BreakerFailure::damaging("token revoked")) })
        .await;

    for _ in 0..100 {
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(breaker.is_damaged());
        assert!(!breaker.is_closed());
    }
    let suppressed = breaker.execute(|_| async { Ok::<_, BreakerFailure>(()) }).await;
    assert!(matches!(suppressed, Err(BreakerError::Damaged { .. })));

    assert!(registry.reset("cloud-print"));
    assert!(breaker.is_closed());
    assert!(!registry.reset("no-such-breaker"));
}

#[tokio::test(start_paused = true)]
async fn test_registry_snapshot_reports_each_dependency() {
    let registry = BreakerRegistry::new(BACKOFF);
    registry.get_or_create("smtp");
    trip(&registry, "imap").await;

    let snapshot = registry.snapshot();
    assert_eq!(snapshot.len(), 2);

    let imap = snapshot.iter().find(|s| s.name == "imap").unwrap();
    assert_eq!(imap.state, CircuitState::Open);
    assert_eq!(imap.millis_until_retry, BACKOFF.as_millis() as u64);
    assert_eq!(imap.last_failure.as_deref(), Some("connection reset"));

    let smtp = snapshot.iter().find(|s| s.name == "smtp").unwrap();
    assert_eq!(smtp.state, CircuitState::Closed);
    assert_eq!(smtp.millis_until_retry, 0);

    registry.reset_all();
    assert!(registry.snapshot().iter().all(|s| s.state == CircuitState::Closed));
}
