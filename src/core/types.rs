//! Core identifier types for the scheduler.
//!
//! These types provide type-safe identifiers for jobs, trigger groups and runs.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Name of a job type (e.g. `"mailbox-monitor"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobName(String);

/// Trigger group a job identity belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JobGroup {
    /// Cron-driven, recurring triggers with a stable identity.
    Scheduled,
    /// Ephemeral single-firing triggers.
    OneShot,
}

/// Identity of a trigger: a job name within a group.
///
/// At most one trigger, and at most one executing firing, exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    name: JobName,
    group: JobGroup,
}

/// Unique identifier for a single firing of a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl JobName {
    /// Create a new JobName from a string.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the underlying string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for JobName {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&JobName> for JobName {
    fn from(name: &JobName) -> Self {
        name.clone()
    }
}

impl JobGroup {
    /// Group name as used in logs and status topics.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobGroup::Scheduled => "SCHEDULED",
            JobGroup::OneShot => "ONESHOT",
        }
    }
}

impl JobKey {
    /// Create a key from a name and group.
    pub fn new(name: impl Into<JobName>, group: JobGroup) -> Self {
        Self {
            name: name.into(),
            group,
        }
    }

    /// Key of a recurring trigger.
    pub fn scheduled(name: impl Into<JobName>) -> Self {
        Self::new(name, JobGroup::Scheduled)
    }

    /// Key of a one-shot trigger.
    pub fn one_shot(name: impl Into<JobName>) -> Self {
        Self::new(name, JobGroup::OneShot)
    }

    /// Job name part of the key.
    pub fn name(&self) -> &JobName {
        &self.name
    }

    /// Group part of the key.
    pub fn group(&self) -> JobGroup {
        self.group
    }
}

impl RunId {
    /// Generate a new random RunId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for JobGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
