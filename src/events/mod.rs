//! Lifecycle events and the publish/notify sink.
//!
//! Every firing emits [`Event::JobStarted`] and [`Event::JobFinished`], and
//! jobs report human-readable status (start, success, failure, next retry)
//! through [`EventBus::publish`]. Handlers decide where the events go: an
//! operator notification channel, a UI, or the log via [`TracingHandler`].

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::core::types::{JobKey, RunId};
use crate::execution::RunOutcome;

/// Severity of a status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StatusLevel {
    Info,
    Warning,
    Error,
}

impl fmt::Display for StatusLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusLevel::Info => f.write_str("INFO"),
            StatusLevel::Warning => f.write_str("WARNING"),
            StatusLevel::Error => f.write_str("ERROR"),
        }
    }
}

/// Events emitted by the scheduler and by jobs.
#[derive(Debug, Clone)]
pub enum Event {
    /// A firing has started its `on_init` phase.
    JobStarted {
        key: JobKey,
        run_id: RunId,
        timestamp: Instant,
    },

    /// A firing has completed `on_exit`.
    JobFinished {
        key: JobKey,
        run_id: RunId,
        outcome: RunOutcome,
        duration: Duration,
        timestamp: Instant,
    },

    /// A human-readable status message.
    Status {
        topic: String,
        level: StatusLevel,
        message: String,
        timestamp: Instant,
    },
}

impl Event {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> Instant {
        match self {
            Event::JobStarted { timestamp, .. } => *timestamp,
            Event::JobFinished { timestamp, .. } => *timestamp,
            Event::Status { timestamp, .. } => *timestamp,
        }
    }

    /// Create a JobStarted event.
    pub fn job_started(key: JobKey, run_id: RunId) -> Self {
        Event::JobStarted {
            key,
            run_id,
            timestamp: Instant::now(),
        }
    }

    /// Create a JobFinished event.
    pub fn job_finished(key: JobKey, run_id: RunId, outcome: RunOutcome, duration: Duration) -> Self {
        Event::JobFinished {
            key,
            run_id,
            outcome,
            duration,
            timestamp: Instant::now(),
        }
    }

    /// Create a Status event.
    pub fn status(topic: impl Into<String>, level: StatusLevel, message: impl Into<String>) -> Self {
        Event::Status {
            topic: topic.into(),
            level,
            message: message.into(),
            timestamp: Instant::now(),
        }
    }
}

/// Handler for receiving events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event);
}

/// Event bus for distributing events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
    }

    /// Emit an event to all registered handlers.
    pub async fn emit(&self, event: Event) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler.handle(&event).await;
        }
    }

    /// Publish a status message on `topic`.
    pub async fn publish(&self, topic: &str, level: StatusLevel, message: impl Into<String>) {
        self.emit(Event::status(topic, level, message)).await;
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Renders events to `tracing`.
pub struct TracingHandler;

#[async_trait]
impl EventHandler for TracingHandler {
    async fn handle(&self, event: &Event) {
        match event {
            Event::JobStarted { key, run_id, .. } => {
                tracing::debug!(job = %key, run_id = %run_id, "Job started");
            }
            Event::JobFinished {
                key,
                run_id,
                outcome,
                duration,
                ..
            } => match outcome {
                RunOutcome::Succeeded => {
                    tracing::debug!(job = %key, run_id = %run_id, ?duration, "Job finished");
                }
                RunOutcome::Interrupted => {
                    tracing::info!(job = %key, run_id = %run_id, ?duration, "Job interrupted");
                }
                RunOutcome::Failed(error) => {
                    tracing::warn!(job = %key, run_id = %run_id, ?duration, error = %error, "Job failed");
                }
            },
            Event::Status {
                topic,
                level,
                message,
                ..
            } => match level {
                StatusLevel::Info => tracing::info!(topic = %topic, "{}", message),
                StatusLevel::Warning => tracing::warn!(topic = %topic, "{}", message),
                StatusLevel::Error => tracing::error!(topic = %topic, "{}", message),
            },
        }
    }
}
