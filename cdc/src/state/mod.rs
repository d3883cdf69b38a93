//! Resumable capture position.
//!
//! The engine tracks two positions in the source's change log:
//!
//! ```text
//!   flushed  <=  confirmed  <=  last read
//!      │             │              │
//!   acknowledged   delivered     received
//!   to the server  to the sink   from the wire
//! ```
//!
//! A position is acknowledged to the server only after it was delivered to the destination and
//! durably persisted through a [`crate::store::state::StateStore`]. A restarted engine resumes
//! from the persisted confirmed position.

pub mod position;
