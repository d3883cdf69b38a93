//! Persistence of capture checkpoints.

pub mod state;
