//! Shared configuration types for CDC pipelines.

mod base;
mod cdc;
mod checkpoint;
mod connection;
mod reconnection;

pub use base::ValidationError;
pub use cdc::CdcConfig;
pub use checkpoint::CheckpointConfig;
pub use connection::{APPLICATION_NAME, PgConnectionConfig, SESSION_OPTIONS, TlsConfig};
pub use reconnection::ReconnectionConfig;
