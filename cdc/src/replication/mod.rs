//! Everything that talks to a replication slot: the Postgres client, the session abstraction,
//! the streaming loop of a session and the reconnection policy.

pub mod apply;
pub mod client;
pub mod reconnect;
pub mod session;
pub mod stream;
