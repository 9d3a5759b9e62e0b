//! Self-rescheduling listener integration tests.
//!
//! Listener chains run inside a real scheduler under a paused clock, so
//! backoff delays of minutes complete instantly and deterministically.

use spoolkeeper::testing::{ListenStep, ListenerScript, wait_until};
use spoolkeeper::{
    BreakerFailure, BreakerRegistry, CircuitBreaker, JobGroup, JobKey, JobParams, ListenError,
    ListenerPolicy, MemoryConfig, RunOutcome, StatusLevel, TriggerKind,
};
use std::sync::Arc;
use std::time::Duration;

use crate::common::{WAIT, start_scheduler};

const BACKOFF: Duration = Duration::from_secs(60);
const MONITOR: &str = "mailbox-monitor";

fn policy() -> ListenerPolicy {
    ListenerPolicy::default()
        .with_success_delay(Duration::from_secs(1))
        .with_cool_down(Duration::from_secs(300))
}

fn pending_delay(handle: &spoolkeeper::SchedulerHandle) -> Option<Duration> {
    match handle.trigger(MONITOR, JobGroup::OneShot)?.kind {
        TriggerKind::OneShot { delay } => Some(delay),
        TriggerKind::Recurring { .. } => None,
    }
}

#[tokio::test(start_paused = true)]
async fn test_tripping_failure_reschedules_once_with_retry_delay() {
    let config = Arc::new(MemoryConfig::new());
    let breaker = Arc::new(CircuitBreaker::new("imap", BACKOFF));
    let script = ListenerScript::new(
        [ListenStep::FailAfter(
            Duration::from_secs(2),
            BreakerFailure::tripping("connection refused").into(),
        )],
        ListenStep::Block,
    );
    let (handle, recorder) = start_scheduler(&config, |s| {
        s.with_job(MONITOR, script.factory(breaker.clone(), policy()))
            .with_shutdown_order([MONITOR])
    })
    .await;
    let key = JobKey::one_shot(MONITOR);

    handle
        .schedule_one_shot(MONITOR, Duration::ZERO, JobParams::new())
        .unwrap();
    assert!(wait_until(WAIT, || recorder.outcomes(&key).len() == 1).await);

    // Exactly one successor, delayed by the breaker's remaining backoff.
    let triggers = handle.triggers();
    assert_eq!(triggers.len(), 1);
    assert_eq!(triggers[0].key, key);
    let delay = pending_delay(&handle).unwrap();
    assert_eq!(delay, BACKOFF);
    assert!(breaker.is_open());
    assert!(breaker.millis_until_retry() <= BACKOFF.as_millis() as u64);

    let warnings: Vec<_> = recorder
        .statuses_for(MONITOR)
        .into_iter()
        .filter(|(level, _)| *level == StatusLevel::Warning)
        .collect();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].1.contains("retry in 60s"));

    // The successor runs after the backoff and reconnects.
    assert!(wait_until(WAIT, || breaker.is_closed()).await);
    assert_eq!(script.runs(), 2);
    assert!(handle.is_running(MONITOR, JobGroup::OneShot));

    handle.shutdown().await.unwrap();
    assert!(handle.triggers().is_empty());
    assert_eq!(script.interrupts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_sustained_outage_keeps_a_single_pending_trigger() {
    let config = Arc::new(MemoryConfig::new());
    let backoff = Duration::from_secs(5);
    let breaker = Arc::new(CircuitBreaker::new("cloud-print", backoff));
    let script = ListenerScript::new(
        [],
        ListenStep::Fail(BreakerFailure::tripping("no route to host").into()),
    );
    let (handle, _recorder) = start_scheduler(&config, |s| {
        s.with_job(MONITOR, script.factory(breaker.clone(), policy()))
    })
    .await;

    handle
        .schedule_one_shot(MONITOR, Duration::ZERO, JobParams::new())
        .unwrap();

    for _ in 0..300 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let triggers = handle.triggers();
        assert!(triggers.len() <= 1);
        if handle.is_running(MONITOR, JobGroup::OneShot) {
            continue;
        }
        if let Some(delay) = pending_delay(&handle) {
            if script.runs() > 0 {
                assert_eq!(delay, backoff);
            }
        }
    }

    // 30 seconds of outage with a 5 second backoff.
    let runs = script.runs();
    assert!((5..=8).contains(&runs), "unexpected run count {}", runs);
    assert_eq!(breaker.status().consecutive_trips, runs);
}

#[tokio::test(start_paused = true)]
async fn test_damaging_failure_ends_chain_until_reset() {
    let config = Arc::new(MemoryConfig::new());
    let registry = BreakerRegistry::new(BACKOFF);
    let breaker = registry.get_or_create("imap");
    let script = ListenerScript::new(
        [ListenStep::Fail(
            BreakerFailure::damaging("authentication rejected").into(),
        )],
        ListenStep::Block,
    );
    let (handle, recorder) = start_scheduler(&config, |s| {
        s.with_job(MONITOR, script.factory(breaker.clone(), policy()))
            .with_shutdown_order([MONITOR])
    })
    .await;
    let key = JobKey::one_shot(MONITOR);

    handle
        .schedule_one_shot(MONITOR, Duration::ZERO, JobParams::new())
        .unwrap();
    assert!(wait_until(WAIT, || recorder.outcomes(&key).len() == 1).await);

    assert!(breaker.is_damaged());
    assert!(handle.triggers().is_empty());
    let errors: Vec<_> = recorder
        .statuses_for(MONITOR)
        .into_iter()
        .filter(|(level, _)| *level == StatusLevel::Error)
        .collect();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].1.contains("authentication rejected"));

    // A manual restart while still damaged does not reach the listener.
    handle
        .schedule_one_shot(MONITOR, Duration::ZERO, JobParams::new())
        .unwrap();
    assert!(wait_until(WAIT, || recorder.outcomes(&key).len() == 2).await);
    assert_eq!(script.runs(), 1);
    assert!(handle.triggers().is_empty());

    assert!(registry.reset("imap"));
    handle
        .schedule_one_shot(MONITOR, Duration::ZERO, JobParams::new())
        .unwrap();
    assert!(wait_until(WAIT, || breaker.is_closed() && script.runs() == 2).await);
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_open_breaker_suspends_firing_for_remaining_time() {
    let config = Arc::new(MemoryConfig::new());
    let breaker = Arc::new(CircuitBreaker::new("imap", BACKOFF));
    breaker.record(&BreakerFailure::tripping("connection refused"));
    tokio::time::advance(Duration::from_secs(20)).await;

    let script = ListenerScript::blocking();
    let (handle, recorder) = start_scheduler(&config, |s| {
        s.with_job(MONITOR, script.factory(breaker.clone(), policy()))
    })
    .await;
    let key = JobKey::one_shot(MONITOR);

    handle
        .schedule_one_shot(MONITOR, Duration::ZERO, JobParams::new())
        .unwrap();
    assert!(wait_until(WAIT, || recorder.outcomes(&key).len() == 1).await);

    assert_eq!(script.runs(), 0);
    assert_eq!(recorder.outcomes(&key), vec![RunOutcome::Succeeded]);
    let delay = pending_delay(&handle).unwrap();
    assert!(delay <= Duration::from_secs(40));
    assert!(delay > Duration::from_secs(39));
}

#[tokio::test(start_paused = true)]
async fn test_disabled_flag_stops_chain_and_unclassified_failure_cools_down() {
    let config = Arc::new(MemoryConfig::new().with("mail-print.enable", false));
    let breaker = Arc::new(CircuitBreaker::new("mail-print", BACKOFF));
    let script = ListenerScript::new(
        [],
        ListenStep::Fail(ListenError::Other("mailbox locked".into())),
    );
    let listener = "mail-print-listener";
    let (handle, recorder) = start_scheduler(&config, |s| {
        s.with_job(
            listener,
            script.factory(
                breaker.clone(),
                policy().with_enable_flag("mail-print.enable"),
            ),
        )
    })
    .await;
    let key = JobKey::one_shot(listener);

    handle
        .schedule_one_shot(listener, Duration::ZERO, JobParams::new())
        .unwrap();
    assert!(wait_until(WAIT, || recorder.outcomes(&key).len() == 1).await);
    assert_eq!(script.runs(), 0);
    assert!(handle.triggers().is_empty());

    config.set("mail-print.enable", true);
    handle
        .schedule_one_shot(listener, Duration::ZERO, JobParams::new())
        .unwrap();
    assert!(wait_until(WAIT, || recorder.outcomes(&key).len() == 2).await);

    assert_eq!(script.runs(), 1);
    assert!(breaker.is_closed());
    match handle.trigger(listener, JobGroup::OneShot).map(|t| t.kind) {
        Some(TriggerKind::OneShot { delay }) => assert_eq!(delay, Duration::from_secs(300)),
        other => panic!("expected a pending one-shot, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_normal_returns_keep_the_chain_running() {
    let config = Arc::new(MemoryConfig::new());
    let breaker = Arc::new(CircuitBreaker::new("soap", BACKOFF));
    let script = ListenerScript::new([], ListenStep::Return);
    let (handle, _recorder) = start_scheduler(&config, |s| {
        s.with_job("system-monitor", script.factory(breaker.clone(), policy()))
    })
    .await;

    handle
        .schedule_one_shot("system-monitor", Duration::ZERO, JobParams::new())
        .unwrap();
    assert!(wait_until(WAIT, || script.runs() >= 5).await);

    assert!(breaker.is_closed());
    handle.shutdown().await.unwrap();
    assert!(handle.triggers().is_empty());
}
