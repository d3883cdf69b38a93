use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Controls how often the engine checkpoints and acknowledges its position.
///
/// A checkpoint is taken as soon as either bound is reached, whichever comes first.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CheckpointConfig {
    /// Number of emitted events after which a checkpoint is taken.
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    /// Maximum time, in milliseconds, between two checkpoints while events are flowing.
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
}

impl CheckpointConfig {
    /// Default number of events between two checkpoints.
    pub const DEFAULT_MAX_EVENTS: usize = 1000;

    /// Default interval between two checkpoints in milliseconds.
    pub const DEFAULT_MAX_INTERVAL_MS: u64 = 5000;

    /// Returns the checkpoint interval as a [`Duration`].
    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    /// Validates checkpoint configuration settings.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_events == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "checkpoint.max_events".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        if self.max_interval_ms == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "checkpoint.max_interval_ms".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            max_events: default_max_events(),
            max_interval_ms: default_max_interval_ms(),
        }
    }
}

fn default_max_events() -> usize {
    CheckpointConfig::DEFAULT_MAX_EVENTS
}

fn default_max_interval_ms() -> u64 {
    CheckpointConfig::DEFAULT_MAX_INTERVAL_MS
}
