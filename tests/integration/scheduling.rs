//! Scheduling integration tests.
//!
//! Failure containment, named locks across firings, interrupts and
//! lifecycle events, observed through a running scheduler.

use async_trait::async_trait;
use parking_lot::Mutex;
use spoolkeeper::testing::{CountingJob, wait_until};
use spoolkeeper::{
    Event, Job, JobContext, JobError, JobGroup, JobKey, JobParams, MemoryConfig, NamedLocks,
    RunOutcome, SchedulerState, StatusLevel, Trigger,
};
use std::sync::Arc;
use std::time::Duration;

use crate::common::{WAIT, start_scheduler};

/// Records the params and trigger of the firing it runs in.
struct Inspect {
    seen: Arc<Mutex<Vec<(Option<String>, Trigger)>>>,
}

#[async_trait]
impl Job for Inspect {
    async fn on_execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        let queue = ctx.params().get_opt::<String>("queue");
        self.seen.lock().push((queue, ctx.trigger().clone()));
        Ok(())
    }
}

/// Takes the same write lock twice, then a read lock on it.
struct Reentrant;

#[async_trait]
impl Job for Reentrant {
    async fn on_init(&self, ctx: &JobContext) -> Result<(), JobError> {
        ctx.lock_write("database").await?;
        ctx.lock_write("database").await?;
        Ok(())
    }

    async fn on_execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        ctx.lock_read("database").await?;
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_panic_fails_firing_and_next_trigger_still_fires() {
    let config = Arc::new(MemoryConfig::new().with("schedule.hourly", "@every 1s"));
    let job = CountingJob::new().panicking();
    let stats = job.stats();
    let (handle, recorder) =
        start_scheduler(&config, |s| s.with_job("hourly", job.factory())).await;

    handle.schedule_recurring("hourly", "schedule.hourly").unwrap();
    assert!(wait_until(WAIT, || stats.executions() >= 2).await);
    assert!(wait_until(WAIT, || stats.exits() >= 2).await);

    let outcomes = recorder.outcomes(&JobKey::scheduled("hourly"));
    assert!(outcomes.len() >= 2);
    for outcome in outcomes {
        match outcome {
            RunOutcome::Failed(message) => assert!(message.contains("panicked")),
            other => panic!("expected failure, got {}", other),
        }
    }
    assert!(
        recorder
            .statuses_for("hourly")
            .iter()
            .any(|(level, message)| *level == StatusLevel::Error && message.contains("panicked"))
    );
    assert_eq!(handle.state(), SchedulerState::Running);
}

#[tokio::test(start_paused = true)]
async fn test_write_lock_released_after_panic() {
    let config = Arc::new(MemoryConfig::new());
    let locks = Arc::new(NamedLocks::new());
    let crashing = CountingJob::new()
        .with_write_lock("database")
        .with_hold(Duration::from_secs(2))
        .panicking();
    let waiting = CountingJob::new().with_write_lock("database");
    let waiting_stats = waiting.stats();
    let (handle, recorder) = start_scheduler(&config, |s| {
        s.with_locks(locks.clone())
            .with_job("print-history-clean", crashing.factory())
            .with_job("user-sync", waiting.factory())
    })
    .await;

    handle
        .schedule_one_shot("print-history-clean", Duration::ZERO, JobParams::new())
        .unwrap();
    assert!(
        wait_until(WAIT, || handle.is_running("print-history-clean", JobGroup::OneShot)).await
    );
    handle
        .schedule_one_shot("user-sync", Duration::ZERO, JobParams::new())
        .unwrap();

    assert!(wait_until(WAIT, || waiting_stats.exits() == 1).await);
    assert_eq!(
        recorder.outcomes(&JobKey::one_shot("user-sync")),
        vec![RunOutcome::Succeeded]
    );
    assert!(matches!(
        recorder.outcomes(&JobKey::one_shot("print-history-clean"))[..],
        [RunOutcome::Failed(_)]
    ));
    assert!(wait_until(WAIT, || locks.try_write("database").is_some()).await);
}

#[tokio::test(start_paused = true)]
async fn test_reacquiring_a_held_lock_does_not_block() {
    let config = Arc::new(MemoryConfig::new());
    let (handle, recorder) = start_scheduler(&config, |s| {
        s.with_job("daily-maintenance", || -> Arc<dyn Job> { Arc::new(Reentrant) })
    })
    .await;
    let key = JobKey::one_shot("daily-maintenance");

    handle
        .schedule_one_shot("daily-maintenance", Duration::ZERO, JobParams::new())
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || !recorder.outcomes(&key).is_empty()).await);
    assert_eq!(recorder.outcomes(&key), vec![RunOutcome::Succeeded]);
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_running_job() {
    let config = Arc::new(MemoryConfig::new());
    let job = CountingJob::new().with_hold(Duration::from_secs(3600));
    let stats = job.stats();
    let (handle, recorder) =
        start_scheduler(&config, |s| s.with_job("cloud-print-listener", job.factory())).await;
    let key = JobKey::one_shot("cloud-print-listener");

    handle
        .schedule_one_shot("cloud-print-listener", Duration::ZERO, JobParams::new())
        .unwrap();
    assert!(wait_until(WAIT, || stats.running() == 1).await);

    assert!(
        handle
            .interrupt("cloud-print-listener", JobGroup::OneShot)
            .await
    );
    assert!(wait_until(WAIT, || !recorder.outcomes(&key).is_empty()).await);

    assert_eq!(recorder.outcomes(&key), vec![RunOutcome::Interrupted]);
    assert_eq!(stats.interrupts(), 1);
    assert_eq!(stats.exits(), 1);
    assert!(
        !handle
            .interrupt("cloud-print-listener", JobGroup::OneShot)
            .await
    );
}

#[tokio::test(start_paused = true)]
async fn test_firings_get_params_trigger_and_events() {
    let config = Arc::new(MemoryConfig::new().with("schedule.weekly", "@every 1s"));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let factory_seen = seen.clone();
    let (handle, recorder) = start_scheduler(&config, |s| {
        s.with_job("weekly", move || -> Arc<dyn Job> {
            Arc::new(Inspect {
                seen: factory_seen.clone(),
            })
        })
    })
    .await;

    handle
        .schedule_one_shot(
            "weekly",
            Duration::from_millis(200),
            JobParams::new().with("queue", "laser-3"),
        )
        .unwrap();
    handle.schedule_recurring("weekly", "schedule.weekly").unwrap();
    assert!(wait_until(WAIT, || seen.lock().len() >= 2).await);

    let seen = seen.lock().clone();
    assert!(seen.contains(&(
        Some("laser-3".to_string()),
        Trigger::OneShot {
            delay: Duration::from_millis(200)
        }
    )));
    assert!(seen.contains(&(
        None,
        Trigger::Recurring {
            config_key: "schedule.weekly".into()
        }
    )));

    let count = |finished: bool| {
        recorder
            .events()
            .iter()
            .filter(|e| match e {
                Event::JobStarted { .. } => !finished,
                Event::JobFinished { .. } => finished,
                Event::Status { .. } => false,
            })
            .count()
    };
    assert!(wait_until(WAIT, || count(true) >= 2).await);
    assert!(count(false) >= count(true));
}

#[tokio::test(start_paused = true)]
async fn test_missed_occurrences_coalesce() {
    let config = Arc::new(MemoryConfig::new().with("schedule.hourly", "@every 1s"));
    let job = CountingJob::new().with_hold(Duration::from_millis(3500));
    let stats = job.stats();
    let (handle, _recorder) =
        start_scheduler(&config, |s| s.with_job("hourly", job.factory())).await;

    handle.schedule_recurring("hourly", "schedule.hourly").unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    // One firing per hold, not one per missed second.
    assert!(stats.executions() >= 2);
    assert!(stats.executions() <= 4);
    assert_eq!(stats.max_concurrent(), 1);
}
