//! Scheduler type definitions.
//!
//! Error types, the runtime state enum and the trigger descriptions returned
//! by introspection.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::core::schedule::ScheduleError;
use crate::core::types::JobKey;

/// Errors that can occur in the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No factory was registered under this job name.
    #[error("job not registered: {0}")]
    JobNotRegistered(String),

    /// A one-shot trigger with this key is already pending.
    #[error("trigger already exists: {0}")]
    AlreadyScheduled(JobKey),

    /// No trigger with this key exists.
    #[error("trigger not found: {0}")]
    TriggerNotFound(JobKey),

    /// The configuration has no cron expression under this key.
    #[error("no cron expression configured under '{0}'")]
    MissingCronExpression(String),

    /// The configured cron expression is invalid.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(#[from] ScheduleError),

    /// The delay reaches past any representable fire time.
    #[error("delay out of range: {0:?}")]
    InvalidDelay(Duration),

    /// The configured timezone is invalid.
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    /// The scheduler no longer accepts new triggers.
    #[error("scheduler is shutting down")]
    ShuttingDown,

    /// Shutdown gave up waiting for these firings.
    #[error("shutdown timed out with {} firing(s) still running", .0.len())]
    ShutdownTimedOut(Vec<JobKey>),
}

/// State of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SchedulerState {
    /// Accepting triggers and firing them.
    Running,
    /// Shutdown in progress; nothing new fires.
    Stopping,
    /// Shutdown complete.
    Stopped,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerState::Running => f.write_str("running"),
            SchedulerState::Stopping => f.write_str("stopping"),
            SchedulerState::Stopped => f.write_str("stopped"),
        }
    }
}

/// How a trigger fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TriggerKind {
    /// Cron expression read from `config_key`; `expression` is the value
    /// last seen, if any.
    Recurring {
        config_key: String,
        expression: Option<String>,
    },
    /// Fires once, `delay` after it was (re)scheduled.
    OneShot { delay: Duration },
}

/// A pending trigger, as reported by
/// [`SchedulerHandle::triggers`](super::SchedulerHandle::triggers).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerInfo {
    pub key: JobKey,
    pub kind: TriggerKind,
    /// `None` for a recurring trigger held on a missing or invalid
    /// expression.
    pub next_fire: Option<DateTime<Utc>>,
    pub paused: bool,
}
