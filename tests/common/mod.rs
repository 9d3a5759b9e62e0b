//! Common test utilities shared across integration tests.

use spoolkeeper::testing::RecordingHandler;
use spoolkeeper::{EventBus, MemoryConfig, Scheduler, SchedulerHandle};
use std::sync::Arc;
use std::time::Duration;

/// Generous upper bound for waits; under a paused clock it costs nothing.
pub const WAIT: Duration = Duration::from_secs(120);

/// Scheduler loop tick used by the tests.
pub const TICK: Duration = Duration::from_millis(10);

/// Route `tracing` output to the test writer, once per process.
///
/// Set `RUST_LOG=spoolkeeper=debug` to see it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Start a scheduler over `config` with a recording event handler.
///
/// `configure` registers jobs and adjusts the builder before start.
pub async fn start_scheduler(
    config: &Arc<MemoryConfig>,
    configure: impl FnOnce(Scheduler) -> Scheduler,
) -> (SchedulerHandle, Arc<RecordingHandler>) {
    init_tracing();

    let bus = Arc::new(EventBus::new());
    let recorder = Arc::new(RecordingHandler::new());
    bus.register(recorder.clone()).await;

    let scheduler = Scheduler::new(config.clone())
        .with_event_bus(bus)
        .with_tick_interval(TICK);
    let (handle, _task) = configure(scheduler).start();
    (handle, recorder)
}
