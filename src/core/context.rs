//! Per-firing execution context.
//!
//! A [`JobContext`] is created when a trigger fires and dropped when the
//! firing's `on_exit` has completed. It carries the job's identity and
//! parameters, the interrupt flag, the named locks the firing holds, and the
//! collaborators a job may need: configuration, the status sink and the
//! scheduler (for self-rescheduling).

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::job::JobParams;
use super::lock::{HeldLocks, LockError, LockMode, NamedLocks};
use super::types::{JobKey, JobName, RunId};
use crate::config::{ConfigSource, MemoryConfig};
use crate::events::{EventBus, StatusLevel};
use crate::scheduler::SchedulerHandle;

/// What caused a firing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// A recurring trigger bound to a cron configuration key.
    Recurring { config_key: String },
    /// A one-shot trigger scheduled with the given delay.
    OneShot { delay: Duration },
    /// Run directly through the lifecycle runner.
    Manual,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Recurring { config_key } => write!(f, "recurring({})", config_key),
            Trigger::OneShot { delay } => write!(f, "one-shot({:?})", delay),
            Trigger::Manual => f.write_str("manual"),
        }
    }
}

/// Execution context of one firing.
pub struct JobContext {
    key: JobKey,
    run_id: RunId,
    params: JobParams,
    trigger: Trigger,
    fired_at: DateTime<Utc>,
    interrupt: CancellationToken,
    locks: HeldLocks,
    config: Arc<dyn ConfigSource>,
    events: Arc<EventBus>,
    scheduler: Option<SchedulerHandle>,
}

impl JobContext {
    /// Create a context with empty configuration, a private event bus and a
    /// private lock registry.
    pub fn new(key: JobKey) -> Self {
        Self {
            key,
            run_id: RunId::new(),
            params: JobParams::new(),
            trigger: Trigger::Manual,
            fired_at: Utc::now(),
            interrupt: CancellationToken::new(),
            locks: HeldLocks::new(Arc::new(NamedLocks::new())),
            config: Arc::new(MemoryConfig::new()),
            events: Arc::new(EventBus::new()),
            scheduler: None,
        }
    }

    /// Set the parameter map.
    pub fn with_params(mut self, params: JobParams) -> Self {
        self.params = params;
        self
    }

    /// Set the trigger that caused the firing.
    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = trigger;
        self
    }

    /// Use a shared lock registry.
    pub fn with_locks(mut self, registry: Arc<NamedLocks>) -> Self {
        self.locks = HeldLocks::new(registry);
        self
    }

    /// Use a shared configuration source.
    pub fn with_config(mut self, config: Arc<dyn ConfigSource>) -> Self {
        self.config = config;
        self
    }

    /// Use a shared event bus.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    /// Attach the scheduler that owns the firing.
    pub fn with_scheduler(mut self, scheduler: SchedulerHandle) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Use an externally owned interrupt token.
    pub fn with_interrupt(mut self, token: CancellationToken) -> Self {
        self.interrupt = token;
        self
    }

    /// Identity of the firing.
    pub fn key(&self) -> &JobKey {
        &self.key
    }

    /// Job name, also used as the status topic.
    pub fn name(&self) -> &JobName {
        self.key.name()
    }

    /// Unique id of this firing.
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Job data map.
    pub fn params(&self) -> &JobParams {
        &self.params
    }

    /// What caused the firing.
    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    /// When the firing started.
    pub fn fired_at(&self) -> DateTime<Utc> {
        self.fired_at
    }

    /// Whether an interrupt has been requested.
    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_cancelled()
    }

    /// Resolves once an interrupt has been requested.
    pub async fn interrupted(&self) {
        self.interrupt.cancelled().await
    }

    /// Set the interrupt flag.
    pub fn interrupt(&self) {
        self.interrupt.cancel();
    }

    /// The interrupt flag as a token, for handing to blocking operations.
    pub fn interrupt_token(&self) -> &CancellationToken {
        &self.interrupt
    }

    /// Sleep for `duration` unless interrupted first.
    ///
    /// Returns `true` if the full duration elapsed, `false` on interrupt.
    /// Polling loops use this as their bounded wait.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.interrupt.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Configuration source.
    pub fn config(&self) -> &dyn ConfigSource {
        self.config.as_ref()
    }

    /// Shared configuration source.
    pub fn config_arc(&self) -> Arc<dyn ConfigSource> {
        Arc::clone(&self.config)
    }

    /// Event bus.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Publish a status message under the job's name.
    pub async fn publish(&self, level: StatusLevel, message: impl Into<String>) {
        self.events
            .publish(self.key.name().as_str(), level, message)
            .await;
    }

    /// The scheduler that fired this job, if any.
    pub fn scheduler(&self) -> Option<&SchedulerHandle> {
        self.scheduler.as_ref()
    }

    /// Acquire the named write lock for the rest of the firing.
    pub async fn lock_write(&self, name: &str) -> Result<(), LockError> {
        self.locks.acquire(name, LockMode::Write).await
    }

    /// Acquire the named read lock for the rest of the firing.
    pub async fn lock_read(&self, name: &str) -> Result<(), LockError> {
        self.locks.acquire(name, LockMode::Read).await
    }

    /// Release one hold on a named lock before the firing ends.
    pub fn unlock(&self, name: &str) -> bool {
        self.locks.release(name)
    }

    /// Locks held by this firing.
    pub fn held_locks(&self) -> &HeldLocks {
        &self.locks
    }

    pub(crate) fn release_locks(&self) -> usize {
        self.locks.release_all()
    }
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("key", &self.key)
            .field("run_id", &self.run_id)
            .field("trigger", &self.trigger)
            .field("interrupted", &self.is_interrupted())
            .finish_non_exhaustive()
    }
}
