//! Postgres specific building blocks shared by the CDC engine: table identifiers, replication
//! slot naming rules and protocol time helpers.

pub mod replication;
pub mod time;
pub mod types;
