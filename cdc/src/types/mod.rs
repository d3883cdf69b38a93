//! Common types used throughout the CDC engine.
//!
//! Re-exports the transport value model, decoded and routed change events, the stream catalog
//! and the Postgres types that positions and tables are expressed in.

mod catalog;
mod event;
mod value;

pub use catalog::*;
pub use event::*;
pub use value::*;

// Re-exports.
pub use cdc_postgres::time::*;
pub use cdc_postgres::types::*;
pub use tokio_postgres::types::PgLsn;
