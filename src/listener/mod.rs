//! Self-rescheduling listeners.
//!
//! A listener supervises one long-lived external channel (a mailbox, a
//! cloud-print push session, a SOAP print monitor). Instead of a thread that
//! loops forever, each firing runs the listener once through its circuit
//! breaker and then reschedules a fresh one-shot firing of itself. The delay
//! depends on how the run ended:
//!
//! | run ended with                    | next firing after               |
//! |-----------------------------------|---------------------------------|
//! | normal return                     | `success_delay`                 |
//! | non-tripping failure              | `success_delay`                 |
//! | tripping failure                  | the breaker's remaining backoff |
//! | breaker still open (not run)      | the breaker's remaining backoff |
//! | unclassified failure or panic     | `cool_down`                     |
//!
//! The chain stops, without rescheduling, when the firing was interrupted,
//! when the breaker is damaged, or when the listener's enable flag is off.
//! Rescheduling replaces the pending trigger in place, so a chain never has
//! more than one pending firing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::breaker::{BreakerError, BreakerFailure, CircuitBreaker, CircuitHandle};
use crate::config::SchedulerSettings;
use crate::core::context::JobContext;
use crate::core::job::{Job, JobError, JobFactory};
use crate::events::StatusLevel;
use crate::scheduler::SchedulerError;

/// How a listener run failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ListenError {
    /// A failure the circuit breaker classifies.
    #[error(transparent)]
    Breaker(#[from] BreakerFailure),

    /// Any other failure; the breaker is not told.
    #[error("{0}")]
    Other(String),
}

/// A blocking listener run inside a circuit breaker.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Open the channel, call [`CircuitHandle::close_circuit`] once it is
    /// usable, then block on it until it ends or the context is interrupted.
    ///
    /// Every blocking wait must be bounded or be unblocked by
    /// [`interrupt`](Self::interrupt).
    async fn listen(&self, circuit: CircuitHandle, ctx: &JobContext) -> Result<(), ListenError>;

    /// Unblock a running [`listen`](Self::listen), typically by closing the
    /// session.
    async fn interrupt(&self) {}
}

/// Delays and switches of a listener chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerPolicy {
    /// Delay after a normal return.
    pub success_delay: Duration,
    /// Delay after an unclassified failure.
    pub cool_down: Duration,
    /// Configuration key of a boolean that must be true for the chain to run.
    pub enable_flag: Option<String>,
}

impl Default for ListenerPolicy {
    fn default() -> Self {
        let settings = SchedulerSettings::default();
        Self::from_settings(&settings)
    }
}

impl ListenerPolicy {
    /// Policy with the delays from `settings` and no enable flag.
    pub fn from_settings(settings: &SchedulerSettings) -> Self {
        Self {
            success_delay: settings.listener_success_delay(),
            cool_down: settings.listener_cool_down(),
            enable_flag: None,
        }
    }

    /// Set the delay after a normal return.
    pub fn with_success_delay(mut self, delay: Duration) -> Self {
        self.success_delay = delay;
        self
    }

    /// Set the delay after an unclassified failure.
    pub fn with_cool_down(mut self, delay: Duration) -> Self {
        self.cool_down = delay;
        self
    }

    /// Require the boolean at `key` to be true.
    pub fn with_enable_flag(mut self, key: impl Into<String>) -> Self {
        self.enable_flag = Some(key.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Reschedule(Duration),
    Disabled,
}

/// Job adapter running a [`Listener`] as one link of a chain.
pub struct ListenerJob<L> {
    listener: L,
    breaker: Arc<CircuitBreaker>,
    policy: Arc<ListenerPolicy>,
    next: Mutex<Option<Next>>,
}

impl<L: Listener> ListenerJob<L> {
    /// Wrap `listener` guarded by `breaker`.
    pub fn new(listener: L, breaker: Arc<CircuitBreaker>, policy: Arc<ListenerPolicy>) -> Self {
        Self {
            listener,
            breaker,
            policy,
            next: Mutex::new(None),
        }
    }

    /// Delay chosen by the last `on_execute`, if it chose one.
    pub fn next_delay(&self) -> Option<Duration> {
        match *self.next.lock() {
            Some(Next::Reschedule(delay)) => Some(delay),
            _ => None,
        }
    }

    fn set_next(&self, next: Next) {
        *self.next.lock() = Some(next);
    }

    fn enabled(&self, ctx: &JobContext) -> bool {
        match &self.policy.enable_flag {
            Some(flag) => ctx.config().get_bool(flag).unwrap_or(false),
            None => true,
        }
    }
}

#[async_trait]
impl<L: Listener + 'static> Job for ListenerJob<L> {
    async fn on_execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        if !self.enabled(ctx) {
            self.set_next(Next::Disabled);
            return Ok(());
        }
        if ctx.is_interrupted() {
            return Err(JobError::Interrupted);
        }

        let listener = &self.listener;
        let result = self
            .breaker
            .execute(|circuit| async move {
                match listener.listen(circuit, ctx).await {
                    Ok(()) => Ok(Ok(())),
                    Err(ListenError::Breaker(failure)) => Err(failure),
                    Err(ListenError::Other(message)) => Ok(Err(message)),
                }
            })
            .await;

        let breaker = self.breaker.name();
        match result {
            Ok(Ok(())) => {
                self.set_next(Next::Reschedule(self.policy.success_delay));
                ctx.publish(StatusLevel::Info, format!("{} listener finished", breaker))
                    .await;
                Ok(())
            }
            Ok(Err(message)) => {
                let delay = self.policy.cool_down;
                self.set_next(Next::Reschedule(delay));
                ctx.publish(
                    StatusLevel::Warning,
                    format!("{}; restarting in {}", message, describe(delay)),
                )
                .await;
                Err(JobError::Reported(message))
            }
            Err(BreakerError::Failed(BreakerFailure::Tripping(message))) => {
                let delay = self.breaker.time_until_retry();
                self.set_next(Next::Reschedule(delay));
                ctx.publish(
                    StatusLevel::Warning,
                    format!("{} unavailable: {}; retry in {}", breaker, message, describe(delay)),
                )
                .await;
                Err(JobError::Reported(message))
            }
            Err(BreakerError::Failed(BreakerFailure::NonTripping(message))) => {
                self.set_next(Next::Reschedule(self.policy.success_delay));
                if ctx.is_interrupted() {
                    Err(JobError::Interrupted)
                } else {
                    ctx.publish(StatusLevel::Info, format!("{} listener stopped: {}", breaker, message))
                        .await;
                    Ok(())
                }
            }
            Err(BreakerError::Failed(BreakerFailure::Damaging(message))) => {
                // on_exit reports the damage and ends the chain.
                self.set_next(Next::Reschedule(self.policy.cool_down));
                Err(JobError::Reported(message))
            }
            Err(BreakerError::Suspended { retry_in, .. }) => {
                tracing::debug!(job = %ctx.key(), breaker, ?retry_in, "Breaker open, not listening");
                self.set_next(Next::Reschedule(retry_in));
                Ok(())
            }
            Err(BreakerError::Damaged { .. }) => {
                self.set_next(Next::Reschedule(self.policy.cool_down));
                Ok(())
            }
        }
    }

    async fn on_exit(&self, ctx: &JobContext) -> Result<(), JobError> {
        if ctx.is_interrupted() {
            ctx.publish(StatusLevel::Info, "Interrupted, not rescheduling")
                .await;
            return Ok(());
        }

        if self.breaker.is_damaged() {
            let reason = self
                .breaker
                .last_failure()
                .unwrap_or_else(|| "unknown failure".to_string());
            ctx.publish(
                StatusLevel::Error,
                format!(
                    "{} is damaged ({}); listener stopped until the breaker is reset",
                    self.breaker.name(),
                    reason
                ),
            )
            .await;
            return Ok(());
        }

        let delay = match *self.next.lock() {
            Some(Next::Disabled) => {
                tracing::info!(job = %ctx.key(), "Listener disabled, ending chain");
                return Ok(());
            }
            Some(Next::Reschedule(delay)) => delay,
            // on_execute never ran to completion (init failure or panic).
            None => self.policy.cool_down,
        };

        let Some(scheduler) = ctx.scheduler() else {
            tracing::debug!(job = %ctx.key(), "No scheduler attached, not rescheduling");
            return Ok(());
        };

        match scheduler.reschedule_one_shot(ctx.name().clone(), delay, ctx.params().clone()) {
            Ok(()) => {
                tracing::debug!(job = %ctx.key(), ?delay, "Listener rescheduled");
                Ok(())
            }
            Err(SchedulerError::ShuttingDown) => {
                tracing::debug!(job = %ctx.key(), "Scheduler shutting down, not rescheduling");
                Ok(())
            }
            Err(e) => Err(JobError::failed(format!("could not reschedule: {}", e))),
        }
    }

    async fn on_interrupt(&self) {
        self.listener.interrupt().await;
    }
}

/// Build a [`JobFactory`] producing a fresh [`ListenerJob`] per firing.
///
/// The breaker and policy are shared by every link of the chain; the
/// listener itself is rebuilt by `make` each time.
pub fn listener_factory<L, F>(
    make: F,
    breaker: Arc<CircuitBreaker>,
    policy: ListenerPolicy,
) -> impl JobFactory
where
    L: Listener + 'static,
    F: Fn() -> L + Send + Sync + 'static,
{
    let policy = Arc::new(policy);
    move || -> Arc<dyn Job> {
        Arc::new(ListenerJob::new(
            make(),
            Arc::clone(&breaker),
            Arc::clone(&policy),
        ))
    }
}

fn describe(delay: Duration) -> String {
    if delay.as_secs() >= 1 && delay.subsec_millis() == 0 {
        format!("{}s", delay.as_secs())
    } else {
        format!("{}ms", delay.as_millis())
    }
}
