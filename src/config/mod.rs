//! Configuration sources and loading.
//!
//! The scheduler and its jobs read configuration by key through the
//! [`ConfigSource`] contract, at start and again at every firing, so a
//! changed value takes effect on the next firing. [`MemoryConfig`] is the
//! in-process implementation; [`YamlLoader`] fills one from a YAML document
//! and reads the scheduler's own [`SchedulerSettings`].

mod error;
mod source;
mod yaml;

pub use error::ConfigError;
pub use source::{ConfigSource, ConfigValue, MemoryConfig};
pub use yaml::{SchedulerSettings, YamlLoader};
