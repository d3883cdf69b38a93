use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Retry policy applied when the replication session is lost.
///
/// The slot is reopened after an exponentially growing delay until either bound is hit:
/// `max_attempts` consecutive failures or `max_retry_duration_ms` since the first of them.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ReconnectionConfig {
    /// When disabled, the first lost session is fatal.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Delay before the first reopen, in milliseconds.
    #[serde(default = "default_initial_retry_delay_ms")]
    pub initial_retry_delay_ms: u64,
    /// Upper bound of a single delay, in milliseconds.
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    /// Growth factor of the delay per attempt, at least 1.0.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Time budget of one failure sequence, in milliseconds.
    #[serde(default = "default_max_retry_duration_ms")]
    pub max_retry_duration_ms: u64,
    /// Consecutive failures tolerated before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl ReconnectionConfig {
    pub const DEFAULT_INITIAL_RETRY_DELAY_MS: u64 = 1000;

    pub const DEFAULT_MAX_RETRY_DELAY_MS: u64 = 60_000;

    pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

    /// Five minutes.
    pub const DEFAULT_MAX_RETRY_DURATION_MS: u64 = 300_000;

    pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

    pub fn initial_retry_delay(&self) -> Duration {
        Duration::from_millis(self.initial_retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn max_retry_duration(&self) -> Duration {
        Duration::from_millis(self.max_retry_duration_ms)
    }

    /// Validates the retry policy.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.backoff_multiplier < 1.0 {
            return Err(invalid(
                "reconnection.backoff_multiplier",
                "must be greater than or equal to 1.0",
            ));
        }

        if self.initial_retry_delay_ms > self.max_retry_delay_ms {
            return Err(invalid(
                "reconnection.initial_retry_delay_ms",
                "must not exceed `max_retry_delay_ms`",
            ));
        }

        if self.enabled && self.max_attempts == 0 {
            return Err(invalid(
                "reconnection.max_attempts",
                "must be greater than 0 when reconnection is enabled",
            ));
        }

        Ok(())
    }
}

fn invalid(field: &str, constraint: &str) -> ValidationError {
    ValidationError::InvalidFieldValue {
        field: field.to_string(),
        constraint: constraint.to_string(),
    }
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            initial_retry_delay_ms: default_initial_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_retry_duration_ms: default_max_retry_duration_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_initial_retry_delay_ms() -> u64 {
    ReconnectionConfig::DEFAULT_INITIAL_RETRY_DELAY_MS
}

fn default_max_retry_delay_ms() -> u64 {
    ReconnectionConfig::DEFAULT_MAX_RETRY_DELAY_MS
}

fn default_backoff_multiplier() -> f64 {
    ReconnectionConfig::DEFAULT_BACKOFF_MULTIPLIER
}

fn default_max_retry_duration_ms() -> u64 {
    ReconnectionConfig::DEFAULT_MAX_RETRY_DURATION_MS
}

fn default_max_attempts() -> u32 {
    ReconnectionConfig::DEFAULT_MAX_ATTEMPTS
}
