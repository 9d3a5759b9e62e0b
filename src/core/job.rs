//! The work-unit trait driven by the lifecycle template.
//!
//! A [`Job`] implements up to four callbacks. The scheduler never calls them
//! directly; it hands a fresh instance (built by the job's [`JobFactory`]) to
//! the [`LifecycleRunner`](crate::execution::LifecycleRunner), which runs
//! `on_init`, `on_execute` and `on_exit` in order and contains every failure.
//! `on_interrupt` may arrive concurrently from another task at any point.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use super::context::JobContext;
use super::lock::LockError;

/// Errors raised by job phases.
///
/// None of these ever reach the scheduling loop; the lifecycle template logs
/// and publishes them and records the firing as failed.
#[derive(Debug, Error)]
pub enum JobError {
    /// Phase failed with a message.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// The firing observed its interrupt flag and gave up.
    #[error("interrupted")]
    Interrupted,

    /// A required parameter is missing from the job data map.
    #[error("missing parameter: {0}")]
    MissingParam(String),

    /// A parameter could not be converted to the requested type.
    #[error("invalid parameter '{key}': {message}")]
    InvalidParam { key: String, message: String },

    /// Named lock acquisition failed.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// The phase panicked.
    #[error("phase panicked: {0}")]
    Panicked(String),

    /// Failure the job has already published on its status topic.
    #[error("{0}")]
    Reported(String),

    /// Generic error wrapper.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl JobError {
    /// Shorthand for [`JobError::ExecutionFailed`].
    pub fn failed(message: impl Into<String>) -> Self {
        JobError::ExecutionFailed(message.into())
    }
}

/// Key/value parameters attached to a one-shot trigger (the job data map).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobParams(HashMap<String, Value>);

impl JobParams {
    /// Create an empty parameter map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert or replace a parameter.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Read a parameter, converting it to `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, JobError> {
        let value = self
            .0
            .get(key)
            .ok_or_else(|| JobError::MissingParam(key.to_string()))?;
        serde_json::from_value(value.clone()).map_err(|e| JobError::InvalidParam {
            key: key.to_string(),
            message: e.to_string(),
        })
    }

    /// Read a parameter, returning `None` if it is absent or has the wrong type.
    pub fn get_opt<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key).ok()
    }

    /// Raw JSON value of a parameter.
    pub fn get_raw(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Whether the parameter exists.
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no parameters.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<HashMap<String, Value>> for JobParams {
    fn from(map: HashMap<String, Value>) -> Self {
        Self(map)
    }
}

/// A unit of work run by the lifecycle template.
///
/// Phases take `&self`; jobs that need per-firing state (an open session, a
/// computed next delay) keep it behind interior mutability. A new instance is
/// created for every firing, so that state never outlives the firing.
///
/// # Example
///
/// ```ignore
/// use spoolkeeper::{Job, JobContext, JobError};
/// use async_trait::async_trait;
///
/// struct PrintHistoryClean;
///
/// #[async_trait]
/// impl Job for PrintHistoryClean {
///     async fn on_init(&self, ctx: &JobContext) -> Result<(), JobError> {
///         ctx.lock_write("database").await?;
///         Ok(())
///     }
///
///     async fn on_execute(&self, ctx: &JobContext) -> Result<(), JobError> {
///         for batch in 0..10 {
///             if ctx.is_interrupted() {
///                 return Err(JobError::Interrupted);
///             }
///             // delete one batch ...
///         }
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Job: Send + Sync {
    /// Best-effort setup, typically acquiring named locks.
    async fn on_init(&self, _ctx: &JobContext) -> Result<(), JobError> {
        Ok(())
    }

    /// The payload.
    async fn on_execute(&self, ctx: &JobContext) -> Result<(), JobError>;

    /// Always runs after `on_init`/`on_execute`, whatever their outcome.
    async fn on_exit(&self, _ctx: &JobContext) -> Result<(), JobError> {
        Ok(())
    }

    /// Asynchronous cancellation request.
    ///
    /// Called from a different task while other phases may be running. Must
    /// unblock any blocking operation promptly (close the session, drop the
    /// connection). The context's interrupt flag is already set when this is
    /// called.
    async fn on_interrupt(&self) {}
}

/// Produces a fresh [`Job`] instance for each firing.
pub trait JobFactory: Send + Sync {
    /// Build the work unit for one firing.
    fn create(&self) -> Arc<dyn Job>;
}

impl<F> JobFactory for F
where
    F: Fn() -> Arc<dyn Job> + Send + Sync,
{
    fn create(&self) -> Arc<dyn Job> {
        self()
    }
}
