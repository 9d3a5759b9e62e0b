//! Trigger scheduling and the job runtime.
//!
//! A [`Scheduler`] is built with the job factories of the host process and
//! started into a background loop. The returned [`SchedulerHandle`] is the
//! only way to add, pause, interrupt or remove triggers and to shut the
//! runtime down.
//!
//! Two trigger groups exist. `Scheduled` triggers are recurring and bound to
//! a cron expression in configuration. `OneShot` triggers fire once after a
//! delay; listeners chain them by rescheduling themselves in place. At most
//! one trigger and at most one executing firing exist per [`JobKey`].
//!
//! [`JobKey`]: crate::core::types::JobKey

mod engine;
mod handle;
mod types;

pub use engine::Scheduler;
pub use handle::SchedulerHandle;
pub use types::{SchedulerError, SchedulerState, TriggerInfo, TriggerKind};
