//! Scheduler handle and the state it shares with the engine.
//!
//! Unlike a command channel, the handle operates on the trigger table
//! directly. Jobs call back into the scheduler from `on_exit` (to reschedule
//! themselves), including while [`SchedulerHandle::shutdown`] is waiting for
//! them to drain, so no operation here may depend on the engine loop being
//! alive to answer.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ConfigSource;
use crate::core::context::JobContext;
use crate::core::instant_after;
use crate::core::job::{Job, JobFactory, JobParams};
use crate::core::lock::NamedLocks;
use crate::core::schedule::Schedule;
use crate::core::types::{JobGroup, JobKey, JobName, RunId};
use crate::events::EventBus;

use super::types::{SchedulerError, SchedulerState, TriggerInfo, TriggerKind};

/// How often shutdown re-checks whether firings have drained.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

pub(crate) enum TriggerSpec {
    Recurring {
        config_key: String,
        expression: Option<String>,
        schedule: Option<Schedule>,
    },
    OneShot {
        delay: Duration,
        params: JobParams,
    },
}

pub(crate) struct TriggerEntry {
    pub(crate) spec: TriggerSpec,
    pub(crate) due: Option<Instant>,
    pub(crate) next_fire: Option<DateTime<Utc>>,
    pub(crate) paused: bool,
}

impl TriggerEntry {
    fn one_shot(delay: Duration, params: JobParams) -> Result<Self, SchedulerError> {
        let due = Instant::now()
            .checked_add(delay)
            .ok_or(SchedulerError::InvalidDelay(delay))?;
        let next_fire = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .ok_or(SchedulerError::InvalidDelay(delay))?;
        Ok(Self {
            spec: TriggerSpec::OneShot { delay, params },
            due: Some(due),
            next_fire: Some(next_fire),
            paused: false,
        })
    }

    fn info(&self, key: &JobKey) -> TriggerInfo {
        let kind = match &self.spec {
            TriggerSpec::Recurring {
                config_key,
                expression,
                ..
            } => TriggerKind::Recurring {
                config_key: config_key.clone(),
                expression: expression.clone(),
            },
            TriggerSpec::OneShot { delay, .. } => TriggerKind::OneShot { delay: *delay },
        };
        TriggerInfo {
            key: key.clone(),
            kind,
            next_fire: self.next_fire,
            paused: self.paused,
        }
    }

    /// Compute the next occurrence of a recurring trigger from now.
    pub(crate) fn advance(&mut self) {
        let TriggerSpec::Recurring { schedule, .. } = &self.spec else {
            return;
        };
        match schedule.as_ref().and_then(next_occurrence) {
            Some((due, at)) => {
                self.due = Some(due);
                self.next_fire = Some(at);
            }
            None => {
                self.due = None;
                self.next_fire = None;
            }
        }
    }
}

pub(crate) struct RunningFiring {
    pub(crate) run_id: RunId,
    pub(crate) job: Arc<dyn Job>,
    pub(crate) ctx: Arc<JobContext>,
}

/// State shared by the engine loop and every handle.
///
/// Lock order is `triggers` before `running`.
pub(crate) struct Shared {
    pub(crate) triggers: Mutex<HashMap<JobKey, TriggerEntry>>,
    pub(crate) running: Mutex<HashMap<JobKey, RunningFiring>>,
    pub(crate) state: RwLock<SchedulerState>,
    pub(crate) factories: HashMap<JobName, Arc<dyn JobFactory>>,
    pub(crate) config: Arc<dyn ConfigSource>,
    pub(crate) events: Arc<EventBus>,
    pub(crate) locks: Arc<NamedLocks>,
    pub(crate) workers: Arc<Semaphore>,
    pub(crate) timezone: Tz,
    pub(crate) shutdown_timeout: Duration,
    pub(crate) shutdown_order: RwLock<Vec<JobName>>,
    pub(crate) wake: Notify,
    pub(crate) stop: CancellationToken,
}

impl Shared {
    /// Re-read the cron expression of a recurring trigger.
    ///
    /// A changed expression is re-parsed and the next occurrence recomputed.
    /// A missing or invalid one holds the trigger. Only changes are logged.
    pub(crate) fn sync_recurring(&self, key: &JobKey, entry: &mut TriggerEntry) {
        let TriggerSpec::Recurring {
            config_key,
            expression,
            schedule,
        } = &mut entry.spec
        else {
            return;
        };

        let current = self.config.get_string(config_key);
        if current == *expression {
            return;
        }

        *schedule = match &current {
            None => {
                tracing::warn!(job = %key, config_key = %config_key, "Cron expression removed, holding trigger");
                None
            }
            Some(expr) => match Schedule::parse_in(expr, self.timezone) {
                Ok(parsed) if parsed.next_after(Utc::now()).is_err() => {
                    tracing::warn!(job = %key, expression = %expr, "Cron expression has no upcoming occurrence, holding trigger");
                    None
                }
                Ok(parsed) => {
                    tracing::info!(job = %key, expression = %expr, "Cron expression updated");
                    Some(parsed)
                }
                Err(e) => {
                    tracing::warn!(job = %key, expression = %expr, error = %e, "Invalid cron expression, holding trigger");
                    None
                }
            },
        };
        *expression = current;
        entry.advance();
    }

    fn ensure_accepting(&self) -> Result<(), SchedulerError> {
        match *self.state.read() {
            SchedulerState::Running => Ok(()),
            SchedulerState::Stopping | SchedulerState::Stopped => Err(SchedulerError::ShuttingDown),
        }
    }

    fn ensure_registered(&self, name: &JobName) -> Result<(), SchedulerError> {
        if self.factories.contains_key(name) {
            Ok(())
        } else {
            Err(SchedulerError::JobNotRegistered(name.to_string()))
        }
    }
}

fn next_occurrence(schedule: &Schedule) -> Option<(Instant, DateTime<Utc>)> {
    let now = Utc::now();
    let next = schedule.next_after(now).ok()?;
    let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
    Some((Instant::now().checked_add(wait)?, next))
}

/// Handle for controlling a running scheduler.
///
/// Cheap to clone. Every firing's context carries one so jobs can
/// reschedule themselves.
#[derive(Clone)]
pub struct SchedulerHandle {
    pub(crate) shared: Arc<Shared>,
}

impl SchedulerHandle {
    /// Bind `name` to the cron expression stored under `config_key`.
    ///
    /// An existing recurring trigger for `name` is replaced. The expression
    /// is re-read from configuration on every tick, so later edits take
    /// effect without calling this again.
    pub fn schedule_recurring(
        &self,
        name: impl Into<JobName>,
        config_key: &str,
    ) -> Result<(), SchedulerError> {
        let name = name.into();
        self.shared.ensure_accepting()?;
        self.shared.ensure_registered(&name)?;

        let expression = self
            .shared
            .config
            .get_string(config_key)
            .ok_or_else(|| SchedulerError::MissingCronExpression(config_key.to_string()))?;
        let schedule = Schedule::parse_in(&expression, self.shared.timezone)?;
        schedule.next_after(Utc::now())?;

        let mut entry = TriggerEntry {
            spec: TriggerSpec::Recurring {
                config_key: config_key.to_string(),
                expression: Some(expression),
                schedule: Some(schedule),
            },
            due: None,
            next_fire: None,
            paused: false,
        };
        entry.advance();

        let key = JobKey::scheduled(name);
        tracing::info!(job = %key, config_key, next_fire = ?entry.next_fire, "Scheduled recurring job");
        let replaced = self.shared.triggers.lock().insert(key.clone(), entry);
        if replaced.is_some() {
            tracing::debug!(job = %key, "Replaced existing recurring trigger");
        }
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Schedule a single firing of `name` after `delay`.
    ///
    /// Fails with [`SchedulerError::AlreadyScheduled`] if a one-shot trigger
    /// for `name` is already pending.
    pub fn schedule_one_shot(
        &self,
        name: impl Into<JobName>,
        delay: Duration,
        params: JobParams,
    ) -> Result<(), SchedulerError> {
        let name = name.into();
        self.shared.ensure_accepting()?;
        self.shared.ensure_registered(&name)?;

        let key = JobKey::one_shot(name);
        let entry = TriggerEntry::one_shot(delay, params)?;
        let mut triggers = self.shared.triggers.lock();
        if triggers.contains_key(&key) {
            return Err(SchedulerError::AlreadyScheduled(key));
        }
        tracing::debug!(job = %key, ?delay, "Scheduled one-shot job");
        triggers.insert(key, entry);
        drop(triggers);

        self.shared.wake.notify_one();
        Ok(())
    }

    /// Schedule a single firing of `name` after `delay`, replacing any
    /// pending one-shot trigger for `name`.
    ///
    /// A paused trigger stays paused.
    pub fn reschedule_one_shot(
        &self,
        name: impl Into<JobName>,
        delay: Duration,
        params: JobParams,
    ) -> Result<(), SchedulerError> {
        let name = name.into();
        self.shared.ensure_accepting()?;
        self.shared.ensure_registered(&name)?;

        let key = JobKey::one_shot(name);
        let mut entry = TriggerEntry::one_shot(delay, params)?;
        let mut triggers = self.shared.triggers.lock();
        if let Some(previous) = triggers.get(&key) {
            entry.paused = previous.paused;
        }
        tracing::debug!(job = %key, ?delay, "Rescheduled one-shot job");
        triggers.insert(key, entry);
        drop(triggers);

        self.shared.wake.notify_one();
        Ok(())
    }

    /// Suspend future firings of a trigger, keeping its definition.
    pub fn pause(&self, name: impl Into<JobName>, group: JobGroup) -> Result<(), SchedulerError> {
        let key = JobKey::new(name, group);
        let mut triggers = self.shared.triggers.lock();
        let entry = triggers
            .get_mut(&key)
            .ok_or_else(|| SchedulerError::TriggerNotFound(key.clone()))?;
        entry.paused = true;
        tracing::info!(job = %key, "Trigger paused");
        Ok(())
    }

    /// Resume a paused trigger.
    ///
    /// Recurring triggers skip the occurrences that fell inside the pause.
    /// One-shot triggers keep their fire time and fire at once if it passed.
    pub fn resume(&self, name: impl Into<JobName>, group: JobGroup) -> Result<(), SchedulerError> {
        let key = JobKey::new(name, group);
        let mut triggers = self.shared.triggers.lock();
        let entry = triggers
            .get_mut(&key)
            .ok_or_else(|| SchedulerError::TriggerNotFound(key.clone()))?;
        if entry.paused {
            entry.paused = false;
            if let TriggerSpec::Recurring { .. } = entry.spec {
                self.shared.sync_recurring(&key, entry);
                entry.advance();
            }
            tracing::info!(job = %key, next_fire = ?entry.next_fire, "Trigger resumed");
        }
        drop(triggers);

        self.shared.wake.notify_one();
        Ok(())
    }

    /// Remove a pending trigger. Returns whether one existed.
    ///
    /// A firing already in progress is not affected.
    pub fn unschedule(&self, name: impl Into<JobName>, group: JobGroup) -> bool {
        let key = JobKey::new(name, group);
        let removed = self.shared.triggers.lock().remove(&key).is_some();
        if removed {
            tracing::info!(job = %key, "Trigger removed");
        }
        removed
    }

    /// Ask the executing firing of a trigger to stop.
    ///
    /// Sets the firing's interrupt flag and awaits its `on_interrupt`.
    /// Returns `false`, without side effects, if nothing is executing.
    pub async fn interrupt(&self, name: impl Into<JobName>, group: JobGroup) -> bool {
        self.interrupt_before(JobKey::new(name, group), None).await
    }

    /// Interrupt, giving up on `on_interrupt` at `deadline` if one is set.
    async fn interrupt_before(&self, key: JobKey, deadline: Option<Instant>) -> bool {
        let target = {
            let running = self.shared.running.lock();
            running
                .get(&key)
                .map(|firing| (Arc::clone(&firing.job), Arc::clone(&firing.ctx)))
        };
        let Some((job, ctx)) = target else {
            return false;
        };

        tracing::info!(job = %key, run_id = %ctx.run_id(), "Interrupting job");
        ctx.interrupt();
        let task = tokio::spawn(async move { job.on_interrupt().await });
        let result = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, task).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(job = %key, "on_interrupt still running at shutdown deadline");
                    return true;
                }
            },
            None => task.await,
        };
        if let Err(e) = result {
            tracing::error!(job = %key, error = %e, "on_interrupt panicked");
        }
        true
    }

    /// Pending triggers, sorted by key.
    pub fn triggers(&self) -> Vec<TriggerInfo> {
        let triggers = self.shared.triggers.lock();
        let mut infos: Vec<_> = triggers.iter().map(|(k, e)| e.info(k)).collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    /// The pending trigger for a key, if any.
    pub fn trigger(&self, name: impl Into<JobName>, group: JobGroup) -> Option<TriggerInfo> {
        let key = JobKey::new(name, group);
        self.shared.triggers.lock().get(&key).map(|e| e.info(&key))
    }

    /// Whether a firing of the trigger is executing.
    pub fn is_running(&self, name: impl Into<JobName>, group: JobGroup) -> bool {
        self.shared
            .running
            .lock()
            .contains_key(&JobKey::new(name, group))
    }

    /// Keys of every executing firing, sorted.
    pub fn running_jobs(&self) -> Vec<JobKey> {
        let mut keys: Vec<_> = self.shared.running.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Job names with a registered factory, sorted.
    pub fn registered_jobs(&self) -> Vec<JobName> {
        let mut names: Vec<_> = self.shared.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether a factory is registered for `name`.
    pub fn is_registered(&self, name: &str) -> bool {
        self.shared.factories.contains_key(&JobName::new(name))
    }

    /// Current scheduler state.
    pub fn state(&self) -> SchedulerState {
        *self.shared.state.read()
    }

    /// Names interrupted and drained first at shutdown, in order.
    pub fn shutdown_order(&self) -> Vec<JobName> {
        self.shared.shutdown_order.read().clone()
    }

    /// Replace the shutdown order.
    pub fn set_shutdown_order<I, N>(&self, order: I)
    where
        I: IntoIterator<Item = N>,
        N: Into<JobName>,
    {
        *self.shared.shutdown_order.write() = order.into_iter().map(Into::into).collect();
    }

    /// Configuration the scheduler reads.
    pub fn config(&self) -> &Arc<dyn ConfigSource> {
        &self.shared.config
    }

    /// Event bus the scheduler reports to.
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.shared.events
    }

    /// Stop the scheduler.
    ///
    /// 1. Stop firing triggers.
    /// 2. In the configured shutdown order, interrupt each monitor and wait
    ///    for it to drain.
    /// 3. Wait for every other in-flight firing.
    /// 4. Stop the engine loop and drop all pending triggers.
    ///
    /// Every wait shares one deadline of `shutdown_timeout`. Firings still
    /// running at the deadline are interrupted and reported in
    /// [`SchedulerError::ShutdownTimedOut`].
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        {
            // Serializes with the engine starting a firing.
            let _triggers = self.shared.triggers.lock();
            let mut state = self.shared.state.write();
            if *state != SchedulerState::Running {
                return Ok(());
            }
            *state = SchedulerState::Stopping;
        }

        let deadline = instant_after(self.shared.shutdown_timeout);
        tracing::info!(timeout = ?self.shared.shutdown_timeout, "Scheduler shutting down");

        for name in self.shutdown_order() {
            for group in [JobGroup::OneShot, JobGroup::Scheduled] {
                let key = JobKey::new(name.clone(), group);
                if self.interrupt_before(key.clone(), Some(deadline)).await {
                    if self.drain(&key, deadline).await {
                        tracing::info!(job = %key, "Monitor drained");
                    } else {
                        tracing::warn!(job = %key, "Monitor did not drain before deadline");
                    }
                }
            }
        }

        let remaining = self.wait_idle(deadline).await;
        self.shared.stop.cancel();
        self.shared.triggers.lock().clear();

        if !remaining.is_empty() {
            for key in &remaining {
                self.interrupt_before(key.clone(), Some(deadline)).await;
            }
            tracing::warn!(
                remaining = remaining.len(),
                "Shutdown timed out, {} firing(s) still running",
                remaining.len()
            );
            *self.shared.state.write() = SchedulerState::Stopped;
            return Err(SchedulerError::ShutdownTimedOut(remaining));
        }

        *self.shared.state.write() = SchedulerState::Stopped;
        tracing::info!("Scheduler stopped");
        Ok(())
    }

    async fn drain(&self, key: &JobKey, deadline: Instant) -> bool {
        loop {
            if !self.shared.running.lock().contains_key(key) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    async fn wait_idle(&self, deadline: Instant) -> Vec<JobKey> {
        let running = self.running_jobs();
        if running.is_empty() {
            return running;
        }
        tracing::info!(running = running.len(), "Waiting for running jobs to complete");

        loop {
            let running = self.running_jobs();
            if running.is_empty() || Instant::now() >= deadline {
                return running;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }
}
