use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::{CheckpointConfig, PgConnectionConfig, ReconnectionConfig, ValidationError};

/// Configuration of a single CDC pipeline, which consumes exactly one replication slot.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CdcConfig {
    /// Name of the logical replication slot consumed by the pipeline.
    #[serde(default = "default_slot_name")]
    pub slot_name: String,
    /// Connection settings of the source database.
    pub pg_connection: PgConnectionConfig,
    /// Checkpoint cadence.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    /// Reconnection policy used when the replication stream is interrupted.
    #[serde(default)]
    pub reconnection: ReconnectionConfig,
    /// Capacity of the queue between the wire reader and the destination writer.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// How long a single read waits for wire data before reporting the stream as idle.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// When set, the pipeline drains and stops after this long without wire data.
    #[serde(default)]
    pub stop_when_idle_ms: Option<u64>,
    /// Whether enabling a stream that was not captured by the previous run aborts startup
    /// with a resynchronization request.
    #[serde(default = "default_resync_on_reselect")]
    pub resync_on_reselect: bool,
}

impl CdcConfig {
    /// Default slot name.
    pub const DEFAULT_SLOT_NAME: &'static str = "tappostgres";

    /// Default capacity of the reader to writer queue.
    pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

    /// Default read timeout in milliseconds.
    pub const DEFAULT_READ_TIMEOUT_MS: u64 = 1000;

    /// Returns the read timeout as a [`Duration`].
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Returns the idle stop threshold as a [`Duration`], if any.
    pub fn stop_when_idle(&self) -> Option<Duration> {
        self.stop_when_idle_ms.map(Duration::from_millis)
    }

    /// Validates the whole configuration tree.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.slot_name.is_empty() {
            return Err(ValidationError::InvalidFieldValue {
                field: "slot_name".to_string(),
                constraint: "must not be empty".to_string(),
            });
        }

        if self.queue_capacity == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "queue_capacity".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        if self.read_timeout_ms == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "read_timeout_ms".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        self.pg_connection.validate()?;
        self.checkpoint.validate()?;
        self.reconnection.validate()?;

        Ok(())
    }
}

fn default_slot_name() -> String {
    CdcConfig::DEFAULT_SLOT_NAME.to_string()
}

fn default_queue_capacity() -> usize {
    CdcConfig::DEFAULT_QUEUE_CAPACITY
}

fn default_read_timeout_ms() -> u64 {
    CdcConfig::DEFAULT_READ_TIMEOUT_MS
}

fn default_resync_on_reselect() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "pg_connection": {
            "host": "localhost",
            "port": 5432,
            "name": "app",
            "username": "replicator",
            "password": null,
            "tls": { "trusted_root_certs": "", "enabled": false }
        }
    }"#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config: CdcConfig = serde_json::from_str(MINIMAL).unwrap();

        assert_eq!(config.slot_name, "tappostgres");
        assert_eq!(config.queue_capacity, 1024);
        assert_eq!(config.read_timeout(), Duration::from_secs(1));
        assert_eq!(config.checkpoint.max_events, 1000);
        assert_eq!(config.stop_when_idle(), None);
        assert!(config.resync_on_reselect);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_queue_capacity_is_rejected() {
        let mut config: CdcConfig = serde_json::from_str(MINIMAL).unwrap();
        config.queue_capacity = 0;

        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidFieldValue { field, .. }) if field == "queue_capacity"
        ));
    }

    #[test]
    fn nested_validation_errors_surface() {
        let mut config: CdcConfig = serde_json::from_str(MINIMAL).unwrap();
        config.checkpoint.max_events = 0;

        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidFieldValue { field, .. }) if field == "checkpoint.max_events"
        ));
    }
}
