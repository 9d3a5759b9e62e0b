//! YAML configuration loading.
//!
//! A configuration document is a tree of maps. Leaves become [`MemoryConfig`]
//! entries under their dotted path, so
//!
//! ```yaml
//! schedule:
//!   daily: "0 0 * * *"
//! mail-print:
//!   enable: true
//! ```
//!
//! yields `schedule.daily` and `mail-print.enable`. The optional `scheduler:`
//! section additionally deserializes into [`SchedulerSettings`].

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::path::Path;
use std::time::Duration;

use super::{ConfigError, ConfigValue, MemoryConfig};

/// Tunables of the scheduler runtime and the listener pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Size of the worker pool.
    pub workers: usize,
    /// How often the scheduler loop checks for due triggers.
    pub tick_interval_ms: u64,
    /// How long shutdown waits for in-flight firings.
    pub shutdown_timeout_secs: u64,
    /// Fixed backoff of an `OPEN` circuit breaker.
    pub breaker_backoff_secs: u64,
    /// Delay before a listener runs again after a normal return.
    pub listener_success_delay_ms: u64,
    /// Delay before a listener runs again after an unclassified failure.
    pub listener_cool_down_secs: u64,
    /// Timezone recurring cron expressions are evaluated in.
    pub timezone: Option<String>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            workers: 10,
            tick_interval_ms: 1000,
            shutdown_timeout_secs: 30,
            breaker_backoff_secs: 60,
            listener_success_delay_ms: 1000,
            listener_cool_down_secs: 300,
            timezone: None,
        }
    }
}

impl SchedulerSettings {
    /// Scheduler loop tick.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Shutdown drain timeout.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Circuit breaker backoff.
    pub fn breaker_backoff(&self) -> Duration {
        Duration::from_secs(self.breaker_backoff_secs)
    }

    /// Listener delay after a normal return.
    pub fn listener_success_delay(&self) -> Duration {
        Duration::from_millis(self.listener_success_delay_ms)
    }

    /// Listener delay after an unclassified failure.
    pub fn listener_cool_down(&self) -> Duration {
        Duration::from_secs(self.listener_cool_down_secs)
    }

    /// Check that the settings describe a runnable scheduler.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::InvalidConfig("workers cannot be zero".into()));
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "tick_interval_ms cannot be zero".into(),
            ));
        }
        match &self.timezone {
            Some(tz) if tz.parse::<chrono_tz::Tz>().is_err() => Err(ConfigError::InvalidConfig(
                format!("unknown timezone: {}", tz),
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SettingsDocument {
    #[serde(default)]
    scheduler: SchedulerSettings,
}

/// Loads configuration from YAML.
pub struct YamlLoader;

impl YamlLoader {
    /// Load a configuration file into a [`MemoryConfig`].
    pub fn load_config(path: impl AsRef<Path>) -> Result<MemoryConfig, ConfigError> {
        let path = path.as_ref();
        let content = read(path)?;
        let value: Value =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::YamlFileError {
                path: path.to_path_buf(),
                source,
            })?;
        Self::flatten(value)
    }

    /// Parse a configuration document into a [`MemoryConfig`].
    pub fn parse_config(yaml: &str) -> Result<MemoryConfig, ConfigError> {
        let value: Value = serde_yaml::from_str(yaml)?;
        Self::flatten(value)
    }

    /// Load the `scheduler:` section of a configuration file.
    pub fn load_settings(path: impl AsRef<Path>) -> Result<SchedulerSettings, ConfigError> {
        let path = path.as_ref();
        let content = read(path)?;
        let doc: SettingsDocument =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::YamlFileError {
                path: path.to_path_buf(),
                source,
            })?;
        doc.scheduler.validate()?;
        Ok(doc.scheduler)
    }

    /// Parse the `scheduler:` section of a configuration document.
    ///
    /// A document without the section yields the defaults.
    pub fn parse_settings(yaml: &str) -> Result<SchedulerSettings, ConfigError> {
        let doc: Option<SettingsDocument> = serde_yaml::from_str(yaml)?;
        let settings = doc.unwrap_or_default().scheduler;
        settings.validate()?;
        Ok(settings)
    }

    fn flatten(value: Value) -> Result<MemoryConfig, ConfigError> {
        let config = MemoryConfig::new();
        match value {
            Value::Null => {}
            Value::Mapping(_) => flatten_into(&config, String::new(), value)?,
            _ => {
                return Err(ConfigError::InvalidConfig(
                    "configuration document must be a mapping".into(),
                ));
            }
        }
        Ok(config)
    }
}

fn read(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadError {
        path: path.to_path_buf(),
        source,
    })
}

fn flatten_into(config: &MemoryConfig, prefix: String, value: Value) -> Result<(), ConfigError> {
    match value {
        Value::Mapping(map) => {
            for (key, child) in map {
                let key = scalar_key(&key)?;
                let path = if prefix.is_empty() {
                    key
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten_into(config, path, child)?;
            }
        }
        Value::Tagged(tagged) => flatten_into(config, prefix, tagged.value)?,
        Value::Null => {}
        leaf => {
            if let Some(v) = leaf_value(&leaf) {
                config.set(prefix, v);
            }
        }
    }
    Ok(())
}

fn scalar_key(key: &Value) -> Result<String, ConfigError> {
    match key {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(ConfigError::InvalidConfig(format!(
            "unsupported key: {:?}",
            other
        ))),
    }
}

fn leaf_value(value: &Value) -> Option<ConfigValue> {
    match value {
        Value::Bool(b) => Some(ConfigValue::Bool(*b)),
        Value::Number(n) => Some(match n.as_i64() {
            Some(i) => ConfigValue::Int(i),
            None => ConfigValue::String(n.to_string()),
        }),
        Value::String(s) => Some(ConfigValue::String(s.clone())),
        // Lists become comma separated strings, e.g. mail server fallbacks.
        Value::Sequence(items) => {
            let parts: Vec<String> = items
                .iter()
                .filter_map(leaf_value)
                .map(|v| v.to_string_value())
                .collect();
            Some(ConfigValue::String(parts.join(",")))
        }
        Value::Tagged(tagged) => leaf_value(&tagged.value),
        Value::Null | Value::Mapping(_) => None,
    }
}
