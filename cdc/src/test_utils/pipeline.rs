use cdc_config::shared::{
    CdcConfig, CheckpointConfig, PgConnectionConfig, ReconnectionConfig, TlsConfig,
};

use crate::destination::Destination;
use crate::pipeline::Pipeline;
use crate::replication::session::SlotSource;
use crate::store::state::StateStore;
use crate::types::StreamCatalogEntry;

/// Connection settings that are never dialed, for pipelines running on a fake slot.
pub fn unused_pg_connection() -> PgConnectionConfig {
    PgConnectionConfig {
        host: "localhost".to_string(),
        port: 5432,
        name: "postgres".to_string(),
        username: "postgres".to_string(),
        password: None,
        tls: TlsConfig::default(),
    }
}

/// Builder for pipelines with timings short enough for tests.
///
/// # Defaults
///
/// * Checkpoint: every 2 events or 50ms
/// * Reconnection: 5 attempts, 10ms initial delay
/// * Read timeout: 20ms, no idle stop
pub struct PipelineBuilder<Src, St, D> {
    catalog: Vec<StreamCatalogEntry>,
    source: Src,
    store: St,
    destination: D,
    config: CdcConfig,
}

impl<Src, St, D> PipelineBuilder<Src, St, D>
where
    Src: SlotSource + Send + Sync + 'static,
    St: StateStore + Clone + Send + Sync + 'static,
    D: Destination + Clone + Send + Sync + 'static,
{
    pub fn new(catalog: Vec<StreamCatalogEntry>, source: Src, store: St, destination: D) -> Self {
        Self {
            catalog,
            source,
            store,
            destination,
            config: CdcConfig {
                slot_name: CdcConfig::DEFAULT_SLOT_NAME.to_string(),
                pg_connection: unused_pg_connection(),
                checkpoint: CheckpointConfig {
                    max_events: 2,
                    max_interval_ms: 50,
                },
                reconnection: ReconnectionConfig {
                    enabled: true,
                    initial_retry_delay_ms: 10,
                    max_retry_delay_ms: 50,
                    backoff_multiplier: 2.0,
                    max_retry_duration_ms: 10_000,
                    max_attempts: 5,
                },
                queue_capacity: 16,
                read_timeout_ms: 20,
                stop_when_idle_ms: None,
                resync_on_reselect: true,
            },
        }
    }

    pub fn with_checkpoint_config(mut self, checkpoint: CheckpointConfig) -> Self {
        self.config.checkpoint = checkpoint;
        self
    }

    pub fn with_reconnection_config(mut self, reconnection: ReconnectionConfig) -> Self {
        self.config.reconnection = reconnection;
        self
    }

    pub fn with_stop_when_idle(mut self, idle_ms: u64) -> Self {
        self.config.stop_when_idle_ms = Some(idle_ms);
        self
    }

    pub fn with_resync_on_reselect(mut self, resync_on_reselect: bool) -> Self {
        self.config.resync_on_reselect = resync_on_reselect;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.config.queue_capacity = queue_capacity;
        self
    }

    pub fn build(self) -> Pipeline<Src, St, D> {
        Pipeline::new(
            self.config,
            self.catalog,
            self.source,
            self.store,
            self.destination,
        )
    }
}
