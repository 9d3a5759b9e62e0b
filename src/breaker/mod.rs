//! Circuit breakers guarding external dependencies.
//!
//! A [`CircuitBreaker`] tracks the health of one external resource (a mail
//! server, a cloud-print channel, a SOAP endpoint). It never retries on its
//! own. It runs a guarded operation, classifies how that operation failed,
//! and remembers the result so the caller can pick its next delay:
//!
//! - [`BreakerFailure::Tripping`] moves the breaker to [`CircuitState::Open`]
//!   with a retry time of now plus the fixed backoff.
//! - [`BreakerFailure::NonTripping`] leaves the state untouched.
//! - [`BreakerFailure::Damaging`] latches [`CircuitState::Damaged`] until
//!   [`CircuitBreaker::reset`] is called.
//!
//! Only the guarded operation can move the breaker back to `Closed`, by
//! calling [`CircuitHandle::close_circuit`] as soon as it has a usable
//! session.

mod registry;

pub use registry::BreakerRegistry;

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::core::instant_after;

/// Health of a guarded dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CircuitState {
    /// Healthy; operations proceed.
    Closed,
    /// Transient failure; operations are suppressed until the retry time.
    Open,
    /// Unrecoverable failure; operations are suppressed until reset.
    Damaged,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => f.write_str("CLOSED"),
            CircuitState::Open => f.write_str("OPEN"),
            CircuitState::Damaged => f.write_str("DAMAGED"),
        }
    }
}

/// How a guarded operation failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BreakerFailure {
    /// Transient dependency failure (network or transport fault).
    #[error("{0}")]
    Tripping(String),

    /// Failure that says nothing about the dependency, such as an interrupt.
    #[error("{0}")]
    NonTripping(String),

    /// Failure that needs outside intervention (credentials rejected,
    /// target gone, protocol not supported).
    #[error("{0}")]
    Damaging(String),
}

impl BreakerFailure {
    /// Build a tripping failure.
    pub fn tripping(message: impl Into<String>) -> Self {
        BreakerFailure::Tripping(message.into())
    }

    /// Build a non-tripping failure.
    pub fn non_tripping(message: impl Into<String>) -> Self {
        BreakerFailure::NonTripping(message.into())
    }

    /// Build a damaging failure.
    pub fn damaging(message: impl Into<String>) -> Self {
        BreakerFailure::Damaging(message.into())
    }

    /// The failure message.
    pub fn message(&self) -> &str {
        match self {
            BreakerFailure::Tripping(m)
            | BreakerFailure::NonTripping(m)
            | BreakerFailure::Damaging(m) => m,
        }
    }
}

/// Why [`CircuitBreaker::execute`] did not return a value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BreakerError {
    /// The breaker is damaged; the operation was not run.
    #[error("circuit '{name}' is damaged")]
    Damaged { name: String },

    /// The breaker is open and the retry time has not passed; the operation
    /// was not run.
    #[error("circuit '{name}' is open, retry in {retry_in:?}")]
    Suspended { name: String, retry_in: Duration },

    /// The operation ran and failed.
    #[error(transparent)]
    Failed(#[from] BreakerFailure),
}

/// Point-in-time view of a breaker, for health reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub millis_until_retry: u64,
    pub consecutive_trips: u32,
    pub last_failure: Option<String>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    retry_at: Option<Instant>,
    consecutive_trips: u32,
    last_failure: Option<String>,
}

impl BreakerInner {
    fn close(&mut self, name: &str) {
        match self.state {
            CircuitState::Closed => {}
            CircuitState::Open => {
                tracing::info!(breaker = name, "Circuit closed");
                self.state = CircuitState::Closed;
                self.retry_at = None;
                self.consecutive_trips = 0;
            }
            CircuitState::Damaged => {
                tracing::warn!(breaker = name, "Ignoring close on damaged circuit");
            }
        }
    }
}

/// The close signal available to a guarded operation.
#[derive(Debug, Clone)]
pub struct CircuitHandle {
    name: Arc<str>,
    inner: Arc<Mutex<BreakerInner>>,
}

impl CircuitHandle {
    /// Report that a usable session with the dependency exists.
    ///
    /// Idempotent in `Closed`; ignored in `Damaged`.
    pub fn close_circuit(&self) {
        self.inner.lock().close(&self.name);
    }

    /// Name of the breaker this handle belongs to.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Circuit breaker for one external dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: Arc<str>,
    backoff: Duration,
    inner: Arc<Mutex<BreakerInner>>,
}

impl CircuitBreaker {
    /// Create a closed breaker with a fixed backoff interval.
    pub fn new(name: impl Into<String>, backoff: Duration) -> Self {
        Self {
            name: Arc::from(name.into()),
            backoff,
            inner: Arc::new(Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                retry_at: None,
                consecutive_trips: 0,
                last_failure: None,
            })),
        }
    }

    /// Name of the guarded dependency.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backoff applied by a tripping failure.
    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Run `op` through the breaker.
    ///
    /// The operation is skipped when the breaker is damaged or open with a
    /// future retry time. Otherwise it runs, and its failure (if any) updates
    /// the state before being returned as [`BreakerError::Failed`].
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T, BreakerError>
    where
        F: FnOnce(CircuitHandle) -> Fut,
        Fut: Future<Output = Result<T, BreakerFailure>>,
    {
        self.check()?;

        match op(self.handle()).await {
            Ok(value) => Ok(value),
            Err(failure) => {
                self.record(&failure);
                Err(BreakerError::Failed(failure))
            }
        }
    }

    fn check(&self) -> Result<(), BreakerError> {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Damaged => Err(BreakerError::Damaged {
                name: self.name.to_string(),
            }),
            CircuitState::Open => {
                let retry_in = remaining(inner.retry_at);
                if retry_in.is_zero() {
                    Ok(())
                } else {
                    Err(BreakerError::Suspended {
                        name: self.name.to_string(),
                        retry_in,
                    })
                }
            }
        }
    }

    fn handle(&self) -> CircuitHandle {
        CircuitHandle {
            name: Arc::clone(&self.name),
            inner: Arc::clone(&self.inner),
        }
    }

    /// Apply a failure classification without running an operation.
    pub fn record(&self, failure: &BreakerFailure) {
        let mut inner = self.inner.lock();
        match failure {
            BreakerFailure::NonTripping(message) => {
                tracing::debug!(breaker = %self.name, reason = %message, "Non-tripping failure");
            }
            BreakerFailure::Tripping(message) => {
                if inner.state == CircuitState::Damaged {
                    return;
                }
                inner.state = CircuitState::Open;
                inner.retry_at = Some(instant_after(self.backoff));
                inner.consecutive_trips = inner.consecutive_trips.saturating_add(1);
                inner.last_failure = Some(message.clone());
                tracing::warn!(
                    breaker = %self.name,
                    error = %message,
                    trips = inner.consecutive_trips,
                    retry_in = ?self.backoff,
                    "Circuit opened"
                );
            }
            BreakerFailure::Damaging(message) => {
                inner.state = CircuitState::Damaged;
                inner.retry_at = None;
                inner.last_failure = Some(message.clone());
                tracing::error!(breaker = %self.name, error = %message, "Circuit damaged");
            }
        }
    }

    /// Clear any state, including `Damaged`, back to `Closed`.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            tracing::info!(breaker = %self.name, from = %inner.state, "Circuit reset");
        }
        inner.state = CircuitState::Closed;
        inner.retry_at = None;
        inner.consecutive_trips = 0;
        inner.last_failure = None;
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Whether the breaker is `Closed`.
    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    /// Whether the breaker is `Damaged`.
    pub fn is_damaged(&self) -> bool {
        self.state() == CircuitState::Damaged
    }

    /// Whether the breaker is `Open`.
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Time left before an `Open` breaker lets operations through.
    ///
    /// Zero when closed, damaged, or open with an elapsed retry time.
    pub fn time_until_retry(&self) -> Duration {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Open => remaining(inner.retry_at),
            CircuitState::Closed | CircuitState::Damaged => Duration::ZERO,
        }
    }

    /// [`time_until_retry`](Self::time_until_retry) in whole milliseconds,
    /// rounded up so a pending retry never reads as zero.
    pub fn millis_until_retry(&self) -> u64 {
        ceil_millis(self.time_until_retry())
    }

    /// Instant after which an `Open` breaker lets operations through.
    pub fn retry_at(&self) -> Option<Instant> {
        self.inner.lock().retry_at
    }

    /// Message of the last tripping or damaging failure.
    pub fn last_failure(&self) -> Option<String> {
        self.inner.lock().last_failure.clone()
    }

    /// Snapshot for health reporting.
    pub fn status(&self) -> BreakerStatus {
        let inner = self.inner.lock();
        let until_retry = match inner.state {
            CircuitState::Open => remaining(inner.retry_at),
            _ => Duration::ZERO,
        };
        BreakerStatus {
            name: self.name.to_string(),
            state: inner.state,
            millis_until_retry: ceil_millis(until_retry),
            consecutive_trips: inner.consecutive_trips,
            last_failure: inner.last_failure.clone(),
        }
    }
}

fn remaining(retry_at: Option<Instant>) -> Duration {
    retry_at
        .map(|at| at.saturating_duration_since(Instant::now()))
        .unwrap_or(Duration::ZERO)
}

fn ceil_millis(d: Duration) -> u64 {
    let millis = u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
    if d.subsec_nanos() % 1_000_000 != 0 {
        millis.saturating_add(1)
    } else {
        millis
    }
}
