//! spoolkeeper - background job scheduling and listener supervision for a
//! print-management server.
//!
//! The crate provides a four-phase job lifecycle, a scheduler for recurring
//! (cron) and one-shot jobs, circuit breakers for external dependencies, and
//! self-rescheduling listener chains built from the three.

pub mod breaker;
pub mod config;
pub mod core;
pub mod events;
pub mod execution;
pub mod listener;
pub mod scheduler;
pub mod startup;
pub mod testing;

pub use breaker::{
    BreakerError, BreakerFailure, BreakerRegistry, BreakerStatus, CircuitBreaker, CircuitHandle,
    CircuitState,
};
pub use config::{ConfigError, ConfigSource, ConfigValue, MemoryConfig, SchedulerSettings, YamlLoader};
pub use core::context::{JobContext, Trigger};
pub use core::job::{Job, JobError, JobFactory, JobParams};
pub use core::lock::{HeldLocks, LockError, LockMode, NamedLocks};
pub use core::schedule::{Schedule, ScheduleError};
pub use core::types::{JobGroup, JobKey, JobName, RunId};
pub use events::{Event, EventBus, EventHandler, StatusLevel, TracingHandler};
pub use execution::{LifecycleRunner, RunOutcome};
pub use listener::{ListenError, Listener, ListenerJob, ListenerPolicy, listener_factory};
pub use scheduler::{
    Scheduler, SchedulerError, SchedulerHandle, SchedulerState, TriggerInfo, TriggerKind,
};
pub use startup::{MonitorEntry, StartupPlan, StartupReport};
