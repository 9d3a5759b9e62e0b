//! Scheduler engine implementation.
//!
//! The engine loop wakes on every tick (or when a handle changes the trigger
//! table), collects the triggers that are due, and starts a firing for each
//! one whose identity is not already executing and for which a worker permit
//! is free. A due trigger that cannot start is held and retried on the next
//! tick; missed recurring occurrences coalesce into that one firing.

use chrono_tz::Tz;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigSource, SchedulerSettings};
use crate::core::context::{JobContext, Trigger};
use crate::core::job::{JobFactory, JobParams};
use crate::core::lock::NamedLocks;
use crate::core::types::{JobKey, JobName, RunId};
use crate::events::EventBus;
use crate::execution::{LifecycleRunner, RunOutcome};

use super::handle::{RunningFiring, SchedulerHandle, Shared, TriggerSpec};
use super::types::{SchedulerError, SchedulerState};

/// Builder and owner of a scheduler until it is started.
pub struct Scheduler {
    config: Arc<dyn ConfigSource>,
    factories: HashMap<JobName, Arc<dyn JobFactory>>,
    event_bus: Arc<EventBus>,
    locks: Arc<NamedLocks>,
    workers: usize,
    tick_interval: Duration,
    shutdown_timeout: Duration,
    shutdown_order: Vec<JobName>,
    timezone: Tz,
}

impl Scheduler {
    /// Create a scheduler reading cron expressions and flags from `config`.
    pub fn new(config: Arc<dyn ConfigSource>) -> Self {
        let defaults = SchedulerSettings::default();
        Self {
            config,
            factories: HashMap::new(),
            event_bus: Arc::new(EventBus::new()),
            locks: Arc::new(NamedLocks::new()),
            workers: defaults.workers,
            tick_interval: defaults.tick_interval(),
            shutdown_timeout: defaults.shutdown_timeout(),
            shutdown_order: Vec::new(),
            timezone: Tz::UTC,
        }
    }

    /// Create a scheduler tuned by `settings`.
    pub fn from_settings(
        config: Arc<dyn ConfigSource>,
        settings: &SchedulerSettings,
    ) -> Result<Self, SchedulerError> {
        let mut scheduler = Self::new(config)
            .with_workers(settings.workers)
            .with_tick_interval(settings.tick_interval())
            .with_shutdown_timeout(settings.shutdown_timeout());
        if let Some(tz) = &settings.timezone {
            scheduler.timezone = tz
                .parse()
                .map_err(|_| SchedulerError::InvalidTimezone(tz.clone()))?;
        }
        Ok(scheduler)
    }

    /// Set the event bus.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    /// Share a named lock registry with code outside the scheduler.
    pub fn with_locks(mut self, locks: Arc<NamedLocks>) -> Self {
        self.locks = locks;
        self
    }

    /// Set the worker pool size. Zero is treated as one.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Set the tick interval.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set the graceful shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the monitors shutdown interrupts first, in order.
    pub fn with_shutdown_order<I, N>(mut self, order: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<JobName>,
    {
        self.shutdown_order = order.into_iter().map(Into::into).collect();
        self
    }

    /// Set the timezone recurring expressions are evaluated in.
    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    /// Register the factory for a job name.
    pub fn register(&mut self, name: impl Into<JobName>, factory: impl JobFactory + 'static) {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_job(mut self, name: impl Into<JobName>, factory: impl JobFactory + 'static) -> Self {
        self.register(name, factory);
        self
    }

    /// Whether a factory is registered for `name`.
    pub fn is_registered(&self, name: &str) -> bool {
        self.factories.contains_key(&JobName::new(name))
    }

    /// Get the event bus.
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Start the engine loop and return a handle for controlling it.
    pub fn start(self) -> (SchedulerHandle, JoinHandle<()>) {
        let shared = Arc::new(Shared {
            triggers: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
            state: RwLock::new(SchedulerState::Running),
            factories: self.factories,
            config: self.config,
            events: Arc::clone(&self.event_bus),
            locks: self.locks,
            workers: Arc::new(Semaphore::new(self.workers)),
            timezone: self.timezone,
            shutdown_timeout: self.shutdown_timeout,
            shutdown_order: RwLock::new(self.shutdown_order),
            wake: Notify::new(),
            stop: CancellationToken::new(),
        });
        let handle = SchedulerHandle { shared };

        tracing::info!(
            workers = self.workers,
            tick = ?self.tick_interval,
            jobs = handle.shared.factories.len(),
            "Scheduler started"
        );

        let engine = Engine {
            handle: handle.clone(),
            runner: LifecycleRunner::new(self.event_bus),
            tick_interval: self.tick_interval,
        };
        let task = tokio::spawn(engine.run());

        (handle, task)
    }
}

struct Engine {
    handle: SchedulerHandle,
    runner: LifecycleRunner,
    tick_interval: Duration,
}

impl Engine {
    async fn run(self) {
        let shared = Arc::clone(&self.handle.shared);
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shared.stop.cancelled() => break,
                _ = interval.tick() => {}
                _ = shared.wake.notified() => {}
            }

            if *shared.state.read() == SchedulerState::Running {
                self.fire_due();
            }
        }
        tracing::debug!("Scheduler loop exited");
    }

    /// Start every due trigger that can start now.
    fn fire_due(&self) {
        let shared = &self.handle.shared;
        let now = Instant::now();

        let mut due: Vec<(Instant, JobKey)> = {
            let mut triggers = shared.triggers.lock();
            let running = shared.running.lock();
            let mut due = Vec::new();
            for (key, entry) in triggers.iter_mut() {
                shared.sync_recurring(key, entry);
                if entry.paused || running.contains_key(key) {
                    continue;
                }
                match entry.due {
                    Some(at) if at <= now => due.push((at, key.clone())),
                    _ => {}
                }
            }
            due
        };
        due.sort();

        for (_, key) in due {
            let permit = match Arc::clone(&shared.workers).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    tracing::debug!(job = %key, "Worker pool exhausted, holding due triggers");
                    break;
                }
            };
            self.start_firing(key, permit);
        }
    }

    fn start_firing(&self, key: JobKey, permit: OwnedSemaphorePermit) {
        let shared = &self.handle.shared;

        let Some(factory) = shared.factories.get(key.name()).cloned() else {
            tracing::error!(job = %key, "No factory registered, dropping trigger");
            shared.triggers.lock().remove(&key);
            return;
        };

        let (job, ctx, run_id) = {
            let mut triggers = shared.triggers.lock();
            let mut running = shared.running.lock();

            // Shutdown flips the state under the triggers lock.
            if *shared.state.read() != SchedulerState::Running {
                return;
            }

            // A handle may have changed the table since the due scan.
            let still_due = triggers.get(&key).is_some_and(|entry| {
                !entry.paused && entry.due.is_some_and(|at| at <= Instant::now())
            });
            if !still_due || running.contains_key(&key) {
                return;
            }

            let recurring_key = match triggers.get(&key).map(|entry| &entry.spec) {
                Some(TriggerSpec::Recurring { config_key, .. }) => Some(config_key.clone()),
                _ => None,
            };
            let (trigger, params) = match recurring_key {
                // Recurring triggers stay in the table; one-shots are consumed.
                Some(config_key) => {
                    if let Some(entry) = triggers.get_mut(&key) {
                        entry.advance();
                    }
                    (Trigger::Recurring { config_key }, JobParams::new())
                }
                None => match triggers.remove(&key).map(|entry| entry.spec) {
                    Some(TriggerSpec::OneShot { delay, params }) => {
                        (Trigger::OneShot { delay }, params)
                    }
                    _ => return,
                },
            };

            let job = factory.create();
            let ctx = Arc::new(
                JobContext::new(key.clone())
                    .with_params(params)
                    .with_trigger(trigger)
                    .with_config(Arc::clone(&shared.config))
                    .with_events(Arc::clone(&shared.events))
                    .with_locks(Arc::clone(&shared.locks))
                    .with_scheduler(self.handle.clone()),
            );
            let run_id = ctx.run_id().clone();
            running.insert(
                key.clone(),
                RunningFiring {
                    run_id: run_id.clone(),
                    job: Arc::clone(&job),
                    ctx: Arc::clone(&ctx),
                },
            );
            (job, ctx, run_id)
        };

        tracing::info!(job = %key, run_id = %run_id, "Firing job");

        let runner = self.runner.clone();
        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            let _permit = permit;
            let outcome = runner.run(job, ctx).await;
            finish(&shared, &key, &run_id, &outcome);
        });
    }
}

fn finish(shared: &Shared, key: &JobKey, run_id: &RunId, outcome: &RunOutcome) {
    {
        let mut running = shared.running.lock();
        if running.get(key).is_some_and(|f| f.run_id == *run_id) {
            running.remove(key);
        }
    }
    match outcome {
        RunOutcome::Succeeded => tracing::debug!(job = %key, run_id = %run_id, "Job completed"),
        RunOutcome::Interrupted => tracing::info!(job = %key, run_id = %run_id, "Job interrupted"),
        RunOutcome::Failed(e) => {
            tracing::warn!(job = %key, run_id = %run_id, error = %e, "Job failed")
        }
    }
    // A held trigger for the same identity may be waiting on this firing.
    shared.wake.notify_one();
}
