//! Graceful shutdown integration tests.
//!
//! Tests that verify shutdown interrupts monitors in the configured order,
//! waits for every in-flight firing to run its exit phase, and stops
//! accepting new work.

use async_trait::async_trait;
use spoolkeeper::testing::{CountingJob, ListenerScript, wait_until};
use spoolkeeper::{
    CircuitBreaker, Event, Job, JobContext, JobError, JobGroup, JobKey, JobParams,
    ListenerPolicy, MemoryConfig, RunOutcome, SchedulerError, SchedulerState,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::common::{WAIT, start_scheduler};

const MONITORS: [&str; 3] = ["system-monitor", "mailbox-monitor", "outbox-monitor"];

/// Ignores its interrupt flag.
struct Stubborn {
    exits: Arc<AtomicU32>,
}

#[async_trait]
impl Job for Stubborn {
    async fn on_execute(&self, _ctx: &JobContext) -> Result<(), JobError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }

    async fn on_exit(&self, _ctx: &JobContext) -> Result<(), JobError> {
        self.exits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Stops on its interrupt flag, but its `on_interrupt` never returns.
struct HangingInterrupt;

#[async_trait]
impl Job for HangingInterrupt {
    async fn on_execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        ctx.interrupted().await;
        Ok(())
    }

    async fn on_interrupt(&self) {
        std::future::pending::<()>().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_drains_three_running_monitors() {
    let config = Arc::new(MemoryConfig::new());
    let scripts: Vec<_> = MONITORS.iter().map(|_| ListenerScript::blocking()).collect();
    let breaker = Arc::new(CircuitBreaker::new("monitors", Duration::from_secs(60)));

    let (handle, recorder) = start_scheduler(&config, |mut s| {
        for (name, script) in MONITORS.iter().zip(&scripts) {
            s.register(*name, script.factory(breaker.clone(), ListenerPolicy::default()));
        }
        s.with_shutdown_order([
            "mail-print-listener",
            "cloud-print-listener",
            "cluster-print-monitor",
            "mailbox-monitor",
            "outbox-monitor",
            "system-monitor",
        ])
    })
    .await;

    for name in MONITORS {
        handle
            .schedule_one_shot(name, Duration::ZERO, JobParams::new())
            .unwrap();
    }
    assert!(wait_until(WAIT, || handle.running_jobs().len() == 3).await);

    handle.shutdown().await.unwrap();

    assert_eq!(handle.state(), SchedulerState::Stopped);
    assert!(handle.running_jobs().is_empty());
    assert!(handle.triggers().is_empty());
    for script in &scripts {
        assert_eq!(script.interrupts(), 1);
    }
    for name in MONITORS {
        assert_eq!(
            recorder.outcomes(&JobKey::one_shot(name)),
            vec![RunOutcome::Interrupted]
        );
    }

    // Monitors finished in shutdown order.
    let finished: Vec<String> = recorder
        .events()
        .iter()
        .filter_map(|e| match e {
            Event::JobFinished { key, .. } => Some(key.name().to_string()),
            _ => None,
        })
        .collect();
    assert_eq!(finished, vec!["mailbox-monitor", "outbox-monitor", "system-monitor"]);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_waits_for_other_firings() {
    let config = Arc::new(MemoryConfig::new().with("schedule.daily-maintenance", "@every 1s"));
    let job = CountingJob::new().with_hold(Duration::from_secs(10));
    let stats = job.stats();
    let (handle, recorder) = start_scheduler(&config, |s| {
        s.with_job("daily-maintenance", job.factory())
    })
    .await;

    handle
        .schedule_recurring("daily-maintenance", "schedule.daily-maintenance")
        .unwrap();
    assert!(wait_until(WAIT, || stats.running() == 1).await);

    handle.shutdown().await.unwrap();

    // Not in the shutdown order, so it ran to completion.
    assert_eq!(stats.exits(), 1);
    assert_eq!(stats.interrupts(), 0);
    assert_eq!(
        recorder.outcomes(&JobKey::scheduled("daily-maintenance")),
        vec![RunOutcome::Succeeded]
    );
    assert_eq!(stats.executions(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_times_out_on_stubborn_job() {
    let config = Arc::new(MemoryConfig::new());
    let exits = Arc::new(AtomicU32::new(0));
    let factory_exits = exits.clone();
    let (handle, _recorder) = start_scheduler(&config, |s| {
        s.with_shutdown_timeout(Duration::from_secs(5)).with_job(
            "doc-log-clean",
            move || -> Arc<dyn Job> {
                Arc::new(Stubborn {
                    exits: factory_exits.clone(),
                })
            },
        )
    })
    .await;

    handle
        .schedule_one_shot("doc-log-clean", Duration::ZERO, JobParams::new())
        .unwrap();
    assert!(wait_until(WAIT, || handle.is_running("doc-log-clean", JobGroup::OneShot)).await);

    match handle.shutdown().await {
        Err(SchedulerError::ShutdownTimedOut(keys)) => {
            assert_eq!(keys, vec![JobKey::one_shot("doc-log-clean")]);
        }
        other => panic!("expected a timeout, got {:?}", other),
    }
    assert_eq!(handle.state(), SchedulerState::Stopped);
    assert_eq!(exits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_rescheduling_is_refused_while_stopping() {
    let config = Arc::new(MemoryConfig::new());
    let (handle, _recorder) = start_scheduler(&config, |s| {
        s.with_job("outbox-monitor", CountingJob::new().factory())
    })
    .await;

    handle.shutdown().await.unwrap();

    assert!(matches!(
        handle.reschedule_one_shot("outbox-monitor", Duration::ZERO, JobParams::new()),
        Err(SchedulerError::ShuttingDown)
    ));
    assert!(matches!(
        handle.schedule_recurring("outbox-monitor", "schedule.outbox"),
        Err(SchedulerError::ShuttingDown)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_hanging_on_interrupt_does_not_outlast_timeout() {
    let config = Arc::new(MemoryConfig::new());
    let timeout = Duration::from_secs(5);
    let (handle, recorder) = start_scheduler(&config, |s| {
        s.with_shutdown_timeout(timeout)
            .with_shutdown_order(["mail-print-listener"])
            .with_job("mail-print-listener", || -> Arc<dyn Job> {
                Arc::new(HangingInterrupt)
            })
    })
    .await;

    handle
        .schedule_one_shot("mail-print-listener", Duration::ZERO, JobParams::new())
        .unwrap();
    assert!(
        wait_until(WAIT, || handle.is_running("mail-print-listener", JobGroup::OneShot)).await
    );

    let started = tokio::time::Instant::now();
    let result = tokio::time::timeout(WAIT, handle.shutdown()).await;

    assert!(result.is_ok(), "shutdown blocked on on_interrupt");
    assert!(started.elapsed() <= timeout + Duration::from_secs(1));
    assert_eq!(handle.state(), SchedulerState::Stopped);
    assert_eq!(
        recorder.outcomes(&JobKey::one_shot("mail-print-listener")),
        vec![RunOutcome::Interrupted]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_racing_due_monitors_leaves_nothing_running() {
    for _ in 0..20 {
        let config = Arc::new(MemoryConfig::new());
        let scripts: Vec<_> = MONITORS.iter().map(|_| ListenerScript::blocking()).collect();
        let breaker = Arc::new(CircuitBreaker::new("monitors", Duration::from_secs(60)));
        let (handle, _recorder) = start_scheduler(&config, |mut s| {
            for (name, script) in MONITORS.iter().zip(&scripts) {
                s.register(*name, script.factory(breaker.clone(), ListenerPolicy::default()));
            }
            s.with_shutdown_timeout(Duration::from_secs(10))
                .with_shutdown_order(MONITORS)
        })
        .await;

        for name in MONITORS {
            handle
                .schedule_one_shot(name, Duration::ZERO, JobParams::new())
                .unwrap();
        }
        // Whatever started before shutdown is interrupted; nothing starts after.
        handle.shutdown().await.unwrap();

        assert!(handle.running_jobs().is_empty());
        assert_eq!(handle.state(), SchedulerState::Stopped);
        for script in &scripts {
            assert!(script.interrupts() <= 1);
        }
    }
}
