//! The key/value configuration contract.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use super::ConfigError;

/// A configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    String(String),
}

impl ConfigValue {
    /// String form of the value. Numbers and booleans are rendered.
    pub fn to_string_value(&self) -> String {
        match self {
            ConfigValue::String(s) => s.clone(),
            ConfigValue::Bool(b) => b.to_string(),
            ConfigValue::Int(i) => i.to_string(),
        }
    }

    /// Boolean form of the value.
    ///
    /// Strings accept `true/false`, `yes/no`, `y/n`, `on/off` and `1/0` in
    /// any case. Integers are true when non-zero.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(b) => Some(*b),
            ConfigValue::Int(i) => Some(*i != 0),
            ConfigValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "y" | "on" | "1" => Some(true),
                "false" | "no" | "n" | "off" | "0" => Some(false),
                _ => None,
            },
        }
    }

    /// Integer form of the value. Strings are parsed.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ConfigValue::Int(i) => Some(*i),
            ConfigValue::String(s) => s.trim().parse().ok(),
            ConfigValue::Bool(_) => None,
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_value())
    }
}

impl From<&str> for ConfigValue {
    fn from(s: &str) -> Self {
        ConfigValue::String(s.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(s: String) -> Self {
        ConfigValue::String(s)
    }
}

impl From<bool> for ConfigValue {
    fn from(b: bool) -> Self {
        ConfigValue::Bool(b)
    }
}

impl From<i64> for ConfigValue {
    fn from(i: i64) -> Self {
        ConfigValue::Int(i)
    }
}

/// Read-only access to configuration by key.
///
/// Implementations must be cheap to query; the scheduler re-reads cron
/// expressions and feature flags at every firing rather than caching them.
pub trait ConfigSource: Send + Sync {
    /// Look up a raw value.
    fn get(&self, key: &str) -> Option<ConfigValue>;

    /// Look up a value as a string.
    fn get_string(&self, key: &str) -> Option<String> {
        self.get(key).map(|v| v.to_string_value())
    }

    /// Look up a value as a boolean. Unparseable values read as absent.
    fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.as_bool())
    }

    /// Look up a value as an integer. Unparseable values read as absent.
    fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.as_int())
    }

    /// Look up a required string value.
    fn require_string(&self, key: &str) -> Result<String, ConfigError> {
        self.get_string(key)
            .ok_or_else(|| ConfigError::MissingKey(key.to_string()))
    }

    /// Look up a required boolean value.
    fn require_bool(&self, key: &str) -> Result<bool, ConfigError> {
        let value = self
            .get(key)
            .ok_or_else(|| ConfigError::MissingKey(key.to_string()))?;
        value.as_bool().ok_or_else(|| ConfigError::TypeMismatch {
            key: key.to_string(),
            expected: "boolean",
        })
    }
}

/// In-memory configuration, mutable at runtime.
#[derive(Debug, Default)]
pub struct MemoryConfig {
    values: RwLock<HashMap<String, ConfigValue>>,
}

impl MemoryConfig {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style set.
    pub fn with(self, key: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        self.set(key, value);
        self
    }

    /// Set or replace a value.
    pub fn set(&self, key: impl Into<String>, value: impl Into<ConfigValue>) {
        self.values.write().insert(key.into(), value.into());
    }

    /// Remove a value. Returns the previous value, if any.
    pub fn remove(&self, key: &str) -> Option<ConfigValue> {
        self.values.write().remove(key)
    }

    /// All keys currently set, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.values.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of values.
    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    /// Whether no values are set.
    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }
}

impl ConfigSource for MemoryConfig {
    fn get(&self, key: &str) -> Option<ConfigValue> {
        self.values.read().get(key).cloned()
    }
}
