//! Change data capture from a Postgres logical replication slot.
//!
//! The engine attaches to a `wal2json` replication slot, decodes every payload into change
//! events, routes them onto the enabled streams of a catalog and hands them to a
//! [`destination::Destination`]. Progress is checkpointed through a [`store::state::StateStore`]
//! before it is acknowledged to the server, so a restart resumes from the last durable position
//! and delivers every change at least once.
//!
//! The entry point is [`pipeline::Pipeline`]:
//!
//! ```rust,no_run
//! use cdc::destination::memory::MemoryDestination;
//! use cdc::pipeline::Pipeline;
//! use cdc::store::state::file::FileStateStore;
//! # use cdc_config::shared::CdcConfig;
//! # async fn example(config: CdcConfig) -> cdc::error::CdcResult<()> {
//! cdc_telemetry::tracing::init_tracing("cdc").ok();
//!
//! let catalog = vec![];
//! let mut pipeline = Pipeline::for_postgres(
//!     config,
//!     catalog,
//!     FileStateStore::new("state.json"),
//!     MemoryDestination::new(),
//! );
//!
//! pipeline.start().await?;
//! pipeline.wait().await?;
//! # Ok(())
//! # }
//! ```

pub mod concurrency;
pub mod conversions;
pub mod destination;
pub mod error;
mod macros;
pub mod pipeline;
pub mod replication;
pub mod router;
pub mod state;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
