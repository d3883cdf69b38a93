//! Decoding of wal2json replication payloads into [`crate::types::ChangeEvent`]s.

pub mod bool;
pub mod event;
pub mod hex;
pub mod value;
mod wal2json;
