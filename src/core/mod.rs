//! Core types: identifiers, schedules, the job contract and named locks.

pub mod context;
pub mod job;
pub mod lock;
pub mod schedule;
pub mod types;

use std::time::Duration;
use tokio::time::Instant;

/// Roughly thirty years; the ceiling for deadlines derived from settings.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `Instant::now() + delay`, clamped to [`FAR_FUTURE`] instead of overflowing.
pub(crate) fn instant_after(delay: Duration) -> Instant {
    Instant::now() + delay.min(FAR_FUTURE)
}
