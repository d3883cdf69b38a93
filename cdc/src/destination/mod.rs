//! Destinations that routed change events are delivered to.

mod base;
pub mod memory;

pub use base::Destination;
