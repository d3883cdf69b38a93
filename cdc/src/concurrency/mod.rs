//! Concurrency primitives used by the flow controller.
//!
//! [`shutdown`] broadcasts a cooperative shutdown request to every task of a pipeline, and
//! [`timer`] provides the checkpoint deadline that is armed on demand inside `tokio::select!`.

pub mod shutdown;
pub mod timer;
