//! Testing utilities for users of the spoolkeeper library.
//!
//! - [`RecordingHandler`]: an event handler that keeps every event it sees
//! - [`CountingJob`]: a configurable job that counts its phases
//! - [`ListenerScript`] / [`ScriptedListener`]: a listener that plays back a
//!   script of outcomes, one per firing
//! - [`wait_until`]: poll a condition with a deadline

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::breaker::{BreakerFailure, CircuitBreaker, CircuitHandle};
use crate::core::context::JobContext;
use crate::core::job::{Job, JobError, JobFactory};
use crate::core::types::JobKey;
use crate::events::{Event, EventHandler, StatusLevel};
use crate::execution::RunOutcome;
use crate::listener::{ListenError, Listener, ListenerPolicy, listener_factory};

/// An event handler that records everything it receives.
///
/// # Example
///
/// ```ignore
/// use spoolkeeper::testing::RecordingHandler;
///
/// let recorder = Arc::new(RecordingHandler::new());
/// bus.register(recorder.clone()).await;
/// // ... run jobs ...
/// assert_eq!(recorder.started("daily"), 1);
/// ```
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<Event>>,
}

impl RecordingHandler {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event received so far.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Status messages as `(topic, level, message)`.
    pub fn statuses(&self) -> Vec<(String, StatusLevel, String)> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Status {
                    topic,
                    level,
                    message,
                    ..
                } => Some((topic.clone(), *level, message.clone())),
                _ => None,
            })
            .collect()
    }

    /// Status messages published under `topic`.
    pub fn statuses_for(&self, topic: &str) -> Vec<(StatusLevel, String)> {
        self.statuses()
            .into_iter()
            .filter(|(t, _, _)| t == topic)
            .map(|(_, level, message)| (level, message))
            .collect()
    }

    /// Number of firings of `name` (any group) that started.
    pub fn started(&self, name: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| {
                matches!(event, Event::JobStarted { key, .. } if key.name().as_str() == name)
            })
            .count()
    }

    /// Outcomes of finished firings of `key`, in completion order.
    pub fn outcomes(&self, key: &JobKey) -> Vec<RunOutcome> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::JobFinished {
                    key: k, outcome, ..
                } if k == key => Some(outcome.clone()),
                _ => None,
            })
            .collect()
    }

    /// Forget everything recorded.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &Event) {
        self.events.lock().push(event.clone());
    }
}

/// Counters shared by every instance a [`CountingJob`] factory builds.
#[derive(Debug, Default)]
pub struct JobStats {
    executions: AtomicU32,
    exits: AtomicU32,
    interrupts: AtomicU32,
    running: AtomicU32,
    max_running: AtomicU32,
}

impl JobStats {
    /// Number of `on_execute` calls.
    pub fn executions(&self) -> u32 {
        self.executions.load(Ordering::SeqCst)
    }

    /// Number of `on_exit` calls.
    pub fn exits(&self) -> u32 {
        self.exits.load(Ordering::SeqCst)
    }

    /// Number of `on_interrupt` calls.
    pub fn interrupts(&self) -> u32 {
        self.interrupts.load(Ordering::SeqCst)
    }

    /// Firings currently inside `on_execute`.
    pub fn running(&self) -> u32 {
        self.running.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous `on_execute` calls seen.
    pub fn max_concurrent(&self) -> u32 {
        self.max_running.load(Ordering::SeqCst)
    }
}

struct RunningGuard<'a>(&'a JobStats);

impl<'a> RunningGuard<'a> {
    fn enter(stats: &'a JobStats) -> Self {
        let now = stats.running.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_running.fetch_max(now, Ordering::SeqCst);
        Self(stats)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A job that counts its phases and optionally holds, fails, panics or
/// takes a named write lock.
///
/// # Example
///
/// ```
/// use spoolkeeper::testing::CountingJob;
/// use std::time::Duration;
///
/// // Holds for 5 seconds (or until interrupted), then fails.
/// let job = CountingJob::new()
///     .with_hold(Duration::from_secs(5))
///     .failing("spool directory missing");
/// let stats = job.stats();
/// assert_eq!(stats.executions(), 0);
/// ```
#[derive(Clone, Default)]
pub struct CountingJob {
    stats: Arc<JobStats>,
    hold: Option<Duration>,
    failure: Option<String>,
    panics: bool,
    write_lock: Option<String>,
}

impl CountingJob {
    /// A job that succeeds immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `hold` inside `on_execute`, returning early on interrupt.
    pub fn with_hold(mut self, hold: Duration) -> Self {
        self.hold = Some(hold);
        self
    }

    /// Fail `on_execute` with `message` after any hold.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    /// Panic in `on_execute` after any hold.
    pub fn panicking(mut self) -> Self {
        self.panics = true;
        self
    }

    /// Take the named write lock in `on_init`.
    pub fn with_write_lock(mut self, name: impl Into<String>) -> Self {
        self.write_lock = Some(name.into());
        self
    }

    /// Counters shared with every instance built from this one.
    pub fn stats(&self) -> Arc<JobStats> {
        Arc::clone(&self.stats)
    }

    /// A factory handing out clones of this job.
    pub fn factory(&self) -> impl JobFactory + use<> {
        let template = self.clone();
        move || -> Arc<dyn Job> { Arc::new(template.clone()) }
    }
}

#[async_trait]
impl Job for CountingJob {
    async fn on_init(&self, ctx: &JobContext) -> Result<(), JobError> {
        if let Some(name) = &self.write_lock {
            ctx.lock_write(name).await?;
        }
        Ok(())
    }

    async fn on_execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        let _running = RunningGuard::enter(&self.stats);
        self.stats.executions.fetch_add(1, Ordering::SeqCst);

        if let Some(hold) = self.hold {
            if !ctx.sleep(hold).await {
                return Err(JobError::Interrupted);
            }
        }
        if self.panics {
            panic!("counting job panicked");
        }
        match &self.failure {
            Some(message) => Err(JobError::failed(message.clone())),
            None => Ok(()),
        }
    }

    async fn on_exit(&self, _ctx: &JobContext) -> Result<(), JobError> {
        self.stats.exits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_interrupt(&self) {
        self.stats.interrupts.fetch_add(1, Ordering::SeqCst);
    }
}

/// One scripted listener run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenStep {
    /// Close the circuit and return normally.
    Return,
    /// Fail immediately.
    Fail(ListenError),
    /// Wait, then fail. An interrupt during the wait ends the run with a
    /// non-tripping failure.
    FailAfter(Duration, ListenError),
    /// Close the circuit and block until interrupted.
    Block,
}

/// Shared script played back by [`ScriptedListener`]s, one step per run.
#[derive(Debug)]
pub struct ListenerScript {
    steps: Mutex<VecDeque<ListenStep>>,
    fallback: ListenStep,
    runs: AtomicU32,
    interrupts: AtomicU32,
}

impl ListenerScript {
    /// A script that plays `steps`, then repeats `fallback` forever.
    pub fn new(steps: impl IntoIterator<Item = ListenStep>, fallback: ListenStep) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into_iter().collect()),
            fallback,
            runs: AtomicU32::new(0),
            interrupts: AtomicU32::new(0),
        })
    }

    /// A listener that blocks until interrupted on every run.
    pub fn blocking() -> Arc<Self> {
        Self::new([], ListenStep::Block)
    }

    /// Number of runs started.
    pub fn runs(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }

    /// Number of `interrupt` calls received.
    pub fn interrupts(&self) -> u32 {
        self.interrupts.load(Ordering::SeqCst)
    }

    /// Append a step.
    pub fn push(&self, step: ListenStep) {
        self.steps.lock().push_back(step);
    }

    /// A listener reading from this script.
    pub fn listener(self: &Arc<Self>) -> ScriptedListener {
        ScriptedListener {
            script: Arc::clone(self),
        }
    }

    /// A listener-job factory reading from this script.
    pub fn factory(
        self: &Arc<Self>,
        breaker: Arc<CircuitBreaker>,
        policy: ListenerPolicy,
    ) -> impl JobFactory + use<> {
        let script = Arc::clone(self);
        listener_factory(move || script.listener(), breaker, policy)
    }

    fn next_step(&self) -> ListenStep {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.steps
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// A [`Listener`] driven by a [`ListenerScript`].
pub struct ScriptedListener {
    script: Arc<ListenerScript>,
}

#[async_trait]
impl Listener for ScriptedListener {
    async fn listen(&self, circuit: CircuitHandle, ctx: &JobContext) -> Result<(), ListenError> {
        match self.script.next_step() {
            ListenStep::Return => {
                circuit.close_circuit();
                Ok(())
            }
            ListenStep::Fail(error) => Err(error),
            ListenStep::FailAfter(wait, error) => {
                if ctx.sleep(wait).await {
                    Err(error)
                } else {
                    Err(BreakerFailure::non_tripping("interrupted").into())
                }
            }
            ListenStep::Block => {
                circuit.close_circuit();
                ctx.interrupted().await;
                Err(BreakerFailure::non_tripping("interrupted").into())
            }
        }
    }

    async fn interrupt(&self) {
        self.script.interrupts.fetch_add(1, Ordering::SeqCst);
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
///
/// Returns whether the condition held. Works under a paused tokio clock.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = crate::core::instant_after(timeout);
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Like [`wait_until`], for conditions that need to await.
pub async fn wait_until_async<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = crate::core::instant_after(timeout);
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
