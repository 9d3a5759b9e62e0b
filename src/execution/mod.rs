//! The job lifecycle template.
//!
//! [`LifecycleRunner::run`] drives one firing through the fixed phase
//! sequence:
//!
//! 1. `on_init`; a failure skips `on_execute`
//! 2. `on_execute`
//! 3. `on_exit`, always
//! 4. release every named lock the firing still holds
//!
//! Each phase runs on its own tokio task, so a panic surfaces as a
//! [`JobError::Panicked`] instead of tearing down the scheduler. Phase errors
//! are logged and published on the job's status topic; they never leave the
//! runner. The caller only learns the [`RunOutcome`].

use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::core::context::JobContext;
use crate::core::job::{Job, JobError};
use crate::events::{Event, EventBus, StatusLevel};

/// Terminal outcome of one firing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RunOutcome {
    /// Every phase returned normally.
    Succeeded,
    /// A phase failed or panicked; carries the first failure.
    Failed(String),
    /// The firing was interrupted.
    Interrupted,
}

impl RunOutcome {
    /// Whether the firing succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Succeeded)
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Succeeded => f.write_str("succeeded"),
            RunOutcome::Failed(e) => write!(f, "failed: {}", e),
            RunOutcome::Interrupted => f.write_str("interrupted"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    Execute,
    Exit,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Init => f.write_str("on_init"),
            Phase::Execute => f.write_str("on_execute"),
            Phase::Exit => f.write_str("on_exit"),
        }
    }
}

/// Runs jobs through the four-phase lifecycle.
#[derive(Clone)]
pub struct LifecycleRunner {
    events: Arc<EventBus>,
}

impl LifecycleRunner {
    /// Create a runner that reports to `events`.
    pub fn new(events: Arc<EventBus>) -> Self {
        Self { events }
    }

    /// Run one firing to completion.
    ///
    /// Never fails: every phase error is contained and reflected in the
    /// returned outcome.
    pub async fn run(&self, job: Arc<dyn Job>, ctx: Arc<JobContext>) -> RunOutcome {
        let key = ctx.key().clone();
        let run_id = ctx.run_id().clone();
        let started = Instant::now();

        self.events
            .emit(Event::job_started(key.clone(), run_id.clone()))
            .await;
        tracing::debug!(job = %key, run_id = %run_id, trigger = %ctx.trigger(), "Firing started");

        let mut first_error: Option<String> = None;

        match self.phase(Phase::Init, &job, &ctx).await {
            Ok(()) => {
                if let Err(e) = self.phase(Phase::Execute, &job, &ctx).await {
                    first_error = Some(format!("{}: {}", Phase::Execute, e));
                }
            }
            Err(e) => first_error = Some(format!("{}: {}", Phase::Init, e)),
        }

        if let Err(e) = self.phase(Phase::Exit, &job, &ctx).await {
            first_error.get_or_insert_with(|| format!("{}: {}", Phase::Exit, e));
        }

        let released = ctx.release_locks();
        if released > 0 {
            tracing::debug!(job = %key, run_id = %run_id, released, "Released named locks");
        }

        let outcome = if ctx.is_interrupted() {
            RunOutcome::Interrupted
        } else {
            match first_error {
                Some(e) => RunOutcome::Failed(e),
                None => RunOutcome::Succeeded,
            }
        };

        let duration = started.elapsed();
        self.events
            .emit(Event::job_finished(key, run_id, outcome.clone(), duration))
            .await;
        outcome
    }

    async fn phase(
        &self,
        phase: Phase,
        job: &Arc<dyn Job>,
        ctx: &Arc<JobContext>,
    ) -> Result<(), JobError> {
        let task_job = Arc::clone(job);
        let task_ctx = Arc::clone(ctx);
        let handle = tokio::spawn(async move {
            match phase {
                Phase::Init => task_job.on_init(&task_ctx).await,
                Phase::Execute => task_job.on_execute(&task_ctx).await,
                Phase::Exit => task_job.on_exit(&task_ctx).await,
            }
        });

        let result = match handle.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(JobError::Panicked(panic_message(e.into_panic()))),
            Err(e) => Err(JobError::failed(format!("phase task aborted: {}", e))),
        };

        if let Err(e) = &result {
            self.report(phase, ctx, e).await;
        }
        result
    }

    async fn report(&self, phase: Phase, ctx: &JobContext, error: &JobError) {
        let key = ctx.key();
        let run_id = ctx.run_id();
        match error {
            JobError::Interrupted => {
                tracing::info!(job = %key, run_id = %run_id, phase = %phase, "Phase interrupted");
            }
            JobError::Reported(msg) => {
                tracing::debug!(job = %key, run_id = %run_id, phase = %phase, error = %msg, "Phase failed");
            }
            JobError::Panicked(msg) => {
                tracing::error!(job = %key, run_id = %run_id, phase = %phase, panic = %msg, "Phase panicked");
                ctx.publish(StatusLevel::Error, format!("{} panicked: {}", phase, msg))
                    .await;
            }
            _ if ctx.is_interrupted() => {
                // Closing a session to unblock a phase usually surfaces as an error.
                tracing::debug!(job = %key, run_id = %run_id, phase = %phase, error = %error, "Phase failed after interrupt");
            }
            _ => {
                tracing::warn!(job = %key, run_id = %run_id, phase = %phase, error = %error, "Phase failed");
                ctx.publish(StatusLevel::Error, format!("{} failed: {}", phase, error))
                    .await;
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
