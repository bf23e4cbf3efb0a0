//! Configuration management for Lockgate.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{LockgateError, Result};
use crate::lock::InMemoryLock;
use crate::throttle::{ThrottleConfiguration, TimeUnit};

/// Prefix for environment variable overrides, e.g. `LOCKGATE__LOCK__NAMESPACE`.
const ENV_PREFIX: &str = "LOCKGATE";

/// Main configuration for Lockgate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockgateConfig {
    /// Lock service configuration
    #[serde(default)]
    pub lock: LockConfig,

    /// Throttle rules
    #[serde(default)]
    pub throttles: Vec<ThrottleRule>,

    /// Debounce rules
    #[serde(default)]
    pub debounces: Vec<DebounceRule>,
}

/// Lock service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Prefix applied to every coordination key
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// How long to wait for a held key, in milliseconds
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Discard updates from holders that overran their lease
    #[serde(default)]
    pub strict_leases: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            strict_leases: false,
        }
    }
}

fn default_namespace() -> String {
    "lockgate".to_string()
}

fn default_acquire_timeout_ms() -> u64 {
    5000
}

/// A named throttle: `executions` per `units` of `unit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleRule {
    /// Coordination key
    pub key: String,
    /// Executions permitted per window
    pub executions: u64,
    /// Window unit
    #[serde(default = "default_unit")]
    pub unit: TimeUnit,
    /// Number of units in the window
    #[serde(default = "default_units")]
    pub units: u64,
}

fn default_unit() -> TimeUnit {
    TimeUnit::Second
}

fn default_units() -> u64 {
    1
}

impl ThrottleRule {
    /// Get the throttle configuration this rule describes.
    pub fn configuration(&self) -> ThrottleConfiguration {
        ThrottleConfiguration::per(self.executions, self.units, self.unit)
    }
}

/// A named debounce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebounceRule {
    /// Coordination key
    pub key: String,
    /// Quiet period in milliseconds
    pub interval_ms: u64,
}

impl LockgateConfig {
    /// Load configuration from a YAML file, then apply `LOCKGATE__*`
    /// environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        let settings = ::config::Config::builder()
            .add_source(::config::File::from_str(&contents, ::config::FileFormat::Yaml))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .map_err(|e| LockgateError::Config(e.to_string()))?;

        let config: LockgateConfig = settings
            .try_deserialize()
            .map_err(|e| LockgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: LockgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| LockgateError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every rule and reject keys used by more than one rule.
    pub fn validate(&self) -> Result<()> {
        let mut keys = HashSet::new();

        for rule in &self.throttles {
            rule.configuration().validate().map_err(|e| {
                LockgateError::Config(format!("throttle {}: {}", rule.key, e))
            })?;
            if !keys.insert(rule.key.as_str()) {
                return Err(LockgateError::Config(format!("duplicate key {}", rule.key)));
            }
        }

        for rule in &self.debounces {
            if rule.interval_ms < 1 {
                return Err(LockgateError::Config(format!(
                    "debounce {}: interval_ms must be at least 1",
                    rule.key
                )));
            }
            if !keys.insert(rule.key.as_str()) {
                return Err(LockgateError::Config(format!("duplicate key {}", rule.key)));
            }
        }

        Ok(())
    }

    /// Find the throttle rule for a key.
    pub fn throttle_rule(&self, key: &str) -> Option<&ThrottleRule> {
        self.throttles.iter().find(|rule| rule.key == key)
    }

    /// Find the debounce rule for a key.
    pub fn debounce_rule(&self, key: &str) -> Option<&DebounceRule> {
        self.debounces.iter().find(|rule| rule.key == key)
    }

    /// Build the in-process lock service described by the `lock` section.
    pub fn in_memory_lock(&self) -> InMemoryLock {
        InMemoryLock::with_namespace(self.lock.namespace.clone())
            .acquire_timeout(Duration::from_millis(self.lock.acquire_timeout_ms))
            .strict_leases(self.lock.strict_leases)
    }
}
