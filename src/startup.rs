//! Startup and shutdown of the background-job catalogue.
//!
//! A [`StartupPlan`] lists what a host starts when it boots: recurring jobs
//! bound to cron keys, monitors started as one-shot chains (some guarded by
//! an enable flag), cleanup jobs fired once, and the order in which monitors
//! are interrupted at shutdown. [`init`] applies a plan to a running
//! scheduler; [`shutdown`] tears it down.
//!
//! The host registers a factory for each job it actually provides. Plan
//! entries without a factory are skipped with a warning, so one catalogue
//! serves hosts with different sets of collaborators.

use std::time::Duration;

use crate::core::job::JobParams;
use crate::core::types::{JobGroup, JobKey, JobName};
use crate::scheduler::{SchedulerError, SchedulerHandle};

/// A monitor started at boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorEntry {
    /// Job name of the monitor.
    pub job: JobName,
    /// Configuration key of a boolean that must be true to start it.
    pub enable_flag: Option<String>,
}

/// What to start at boot and how to stop it.
#[derive(Debug, Clone, Default)]
pub struct StartupPlan {
    recurring: Vec<(JobName, String)>,
    monitors: Vec<MonitorEntry>,
    cleanup: Vec<JobName>,
    shutdown_order: Vec<JobName>,
}

impl StartupPlan {
    /// Create an empty plan.
    pub fn new() -> Self {
        Self::default()
    }

    /// The print-server catalogue.
    ///
    /// Recurring jobs read their expression from `schedule.<job>`.
    pub fn print_server() -> Self {
        let mut plan = Self::new();
        for job in ["hourly", "daily", "weekly", "monthly", "daily-maintenance"] {
            plan = plan.with_recurring(job, format!("schedule.{}", job));
        }
        plan.with_monitor("system-monitor")
            .with_monitor("mailbox-monitor")
            .with_monitor("outbox-monitor")
            .with_conditional_monitor("cluster-print-monitor", "cluster-print.enable")
            .with_conditional_monitor("mail-print-listener", "mail-print.enable")
            .with_cleanup("app-log-clean")
            .with_cleanup("doc-log-clean")
            .with_cleanup("print-in-clean")
            .with_shutdown_order([
                "mail-print-listener",
                "cloud-print-listener",
                "cluster-print-monitor",
                "mailbox-monitor",
                "outbox-monitor",
                "system-monitor",
            ])
    }

    /// Bind a recurring job to the cron expression under `config_key`.
    pub fn with_recurring(mut self, job: impl Into<JobName>, config_key: impl Into<String>) -> Self {
        self.recurring.push((job.into(), config_key.into()));
        self
    }

    /// Start a monitor unconditionally.
    pub fn with_monitor(mut self, job: impl Into<JobName>) -> Self {
        self.monitors.push(MonitorEntry {
            job: job.into(),
            enable_flag: None,
        });
        self
    }

    /// Start a monitor only while the boolean at `flag` is true.
    pub fn with_conditional_monitor(
        mut self,
        job: impl Into<JobName>,
        flag: impl Into<String>,
    ) -> Self {
        self.monitors.push(MonitorEntry {
            job: job.into(),
            enable_flag: Some(flag.into()),
        });
        self
    }

    /// Fire a job once at boot.
    pub fn with_cleanup(mut self, job: impl Into<JobName>) -> Self {
        self.cleanup.push(job.into());
        self
    }

    /// Set the monitors interrupted first at shutdown, in order.
    pub fn with_shutdown_order<I, N>(mut self, order: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<JobName>,
    {
        self.shutdown_order = order.into_iter().map(Into::into).collect();
        self
    }

    /// Recurring jobs and their cron keys.
    pub fn recurring(&self) -> &[(JobName, String)] {
        &self.recurring
    }

    /// Monitors started at boot.
    pub fn monitors(&self) -> &[MonitorEntry] {
        &self.monitors
    }

    /// Jobs fired once at boot.
    pub fn cleanup(&self) -> &[JobName] {
        &self.cleanup
    }

    /// Shutdown interrupt order. [`init`] installs it on a scheduler that
    /// has none of its own.
    pub fn shutdown_order(&self) -> &[JobName] {
        &self.shutdown_order
    }
}

/// What [`init`] did with each plan entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupReport {
    /// Triggers created.
    pub scheduled: Vec<JobKey>,
    /// Conditional monitors whose flag was off.
    pub disabled: Vec<JobName>,
    /// Plan entries with no registered factory.
    pub unregistered: Vec<JobName>,
    /// Entries that could not be scheduled, with the reason.
    pub failed: Vec<(JobName, String)>,
}

impl StartupReport {
    /// Whether every registered entry was scheduled.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Apply `plan` to a running scheduler.
///
/// A bad entry (missing or invalid cron expression) is logged and recorded
/// in the report without stopping the rest of the plan. Only a scheduler
/// that is shutting down aborts it.
///
/// The plan's shutdown order is installed if the scheduler has none.
pub fn init(handle: &SchedulerHandle, plan: &StartupPlan) -> Result<StartupReport, SchedulerError> {
    let mut report = StartupReport::default();

    if handle.shutdown_order().is_empty() && !plan.shutdown_order().is_empty() {
        tracing::debug!(order = ?plan.shutdown_order(), "Installing plan shutdown order");
        handle.set_shutdown_order(plan.shutdown_order().iter().cloned());
    }

    for (job, config_key) in plan.recurring() {
        if !registered(handle, job, &mut report) {
            continue;
        }
        let result = handle.schedule_recurring(job.clone(), config_key);
        record(&mut report, JobKey::scheduled(job.clone()), result)?;
    }

    for monitor in plan.monitors() {
        if !registered(handle, &monitor.job, &mut report) {
            continue;
        }
        if let Some(flag) = &monitor.enable_flag {
            if handle.config().get_bool(flag) != Some(true) {
                tracing::info!(job = %monitor.job, flag, "Monitor disabled");
                handle.unschedule(monitor.job.clone(), JobGroup::OneShot);
                report.disabled.push(monitor.job.clone());
                continue;
            }
        }
        start_once(handle, &monitor.job, &mut report)?;
    }

    for job in plan.cleanup() {
        if !registered(handle, job, &mut report) {
            continue;
        }
        start_once(handle, job, &mut report)?;
    }

    tracing::info!(
        scheduled = report.scheduled.len(),
        disabled = report.disabled.len(),
        unregistered = report.unregistered.len(),
        failed = report.failed.len(),
        "Startup plan applied"
    );
    Ok(report)
}

/// Stop the scheduler: interrupt monitors in order, wait for every firing to
/// drain, then stop the engine.
pub async fn shutdown(handle: &SchedulerHandle) -> Result<(), SchedulerError> {
    handle.shutdown().await
}

fn registered(handle: &SchedulerHandle, job: &JobName, report: &mut StartupReport) -> bool {
    if handle.is_registered(job.as_str()) {
        return true;
    }
    tracing::warn!(job = %job, "No factory registered, skipping");
    report.unregistered.push(job.clone());
    false
}

fn start_once(
    handle: &SchedulerHandle,
    job: &JobName,
    report: &mut StartupReport,
) -> Result<(), SchedulerError> {
    let key = JobKey::one_shot(job.clone());
    match handle.schedule_one_shot(job.clone(), Duration::ZERO, JobParams::new()) {
        // A chain seeded by an earlier init is already pending.
        Err(SchedulerError::AlreadyScheduled(_)) => {
            tracing::debug!(job = %key, "Already scheduled");
            Ok(())
        }
        result => record(report, key, result),
    }
}

fn record(
    report: &mut StartupReport,
    key: JobKey,
    result: Result<(), SchedulerError>,
) -> Result<(), SchedulerError> {
    match result {
        Ok(()) => {
            report.scheduled.push(key);
            Ok(())
        }
        Err(SchedulerError::ShuttingDown) => Err(SchedulerError::ShuttingDown),
        Err(e) => {
            tracing::error!(job = %key, error = %e, "Could not schedule job");
            report.failed.push((key.name().clone(), e.to_string()));
            Ok(())
        }
    }
}
