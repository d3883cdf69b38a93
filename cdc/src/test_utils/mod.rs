//! Utilities for testing the engine without a Postgres server.
//!
//! - [`slot`] - a scripted in-memory replication slot implementing [`crate::replication::session::SlotSource`]
//! - [`payload`] - builders for wal2json format version 2 payloads
//! - [`catalog`] - catalog entries of the test tables
//! - [`pipeline`] - a pipeline builder with timings tuned for fast tests
//! - [`test_destination_wrapper`] - a destination wrapper that records writes and notifies on conditions
//! - [`store`] - a state store wrapper journaling persisted checkpoints
//! - [`notify`] - notifications with a timeout

pub mod catalog;
pub mod notify;
pub mod payload;
pub mod pipeline;
pub mod slot;
pub mod store;
pub mod test_destination_wrapper;
