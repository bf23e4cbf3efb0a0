//! Throttle configuration and rate expression helpers.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LockgateError, Result};

/// Time unit for rate expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the length of one unit in milliseconds.
    pub fn millis(&self) -> u64 {
        match self {
            TimeUnit::Second => 1_000,
            TimeUnit::Minute => 60_000,
            TimeUnit::Hour => 3_600_000,
            TimeUnit::Day => 86_400_000,
        }
    }
}

/// At most `executions` executions per rolling `interval_ms`.
///
/// Two configurations are compatible only when both fields are equal. The
/// field names match the encoded state shared with other callers of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThrottleConfiguration {
    /// Executions permitted per interval
    pub executions: u64,
    /// Length of the rolling window in milliseconds
    pub interval_ms: u64,
}

impl ThrottleConfiguration {
    /// Create a configuration. Values are checked when a throttle is built.
    pub fn new(executions: u64, interval_ms: u64) -> Self {
        Self {
            executions,
            interval_ms,
        }
    }

    /// `executions` per `count` of `unit`.
    pub fn per(executions: u64, count: u64, unit: TimeUnit) -> Self {
        Self::new(executions, count.saturating_mul(unit.millis()))
    }

    /// Reject configurations that cannot describe a window.
    pub fn validate(&self) -> Result<()> {
        if self.executions < 1 {
            return Err(LockgateError::InvalidConfiguration(
                "Executions must be at least 1".to_string(),
            ));
        }
        if self.interval_ms < 1 {
            return Err(LockgateError::InvalidConfiguration(
                "Interval must be at least 1ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Get the rolling window length.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Lease held for a single decision: the minimum spacing between slot
    /// replacements, never less than one millisecond.
    pub fn lease(&self) -> Duration {
        let spacing = self.interval_ms / self.executions.max(1);
        Duration::from_millis(spacing.max(1))
    }
}

impl fmt::Display for ThrottleConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} executions per {}ms", self.executions, self.interval_ms)
    }
}

/// `executions` per `seconds` seconds.
pub fn per_second(executions: u64, seconds: u64) -> ThrottleConfiguration {
    ThrottleConfiguration::per(executions, seconds, TimeUnit::Second)
}

/// `executions` per `minutes` minutes.
pub fn per_minute(executions: u64, minutes: u64) -> ThrottleConfiguration {
    ThrottleConfiguration::per(executions, minutes, TimeUnit::Minute)
}

/// `executions` per `hours` hours.
pub fn per_hour(executions: u64, hours: u64) -> ThrottleConfiguration {
    ThrottleConfiguration::per(executions, hours, TimeUnit::Hour)
}

/// `executions` per `days` days.
pub fn per_day(executions: u64, days: u64) -> ThrottleConfiguration {
    ThrottleConfiguration::per(executions, days, TimeUnit::Day)
}
