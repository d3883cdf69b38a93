//! Configuration types shared by the CDC engine crates.
//!
//! Parsing configuration files is left to the embedding application; this crate only defines
//! the serde shapes, their defaults and their validation rules.

mod secret;
pub mod shared;

pub use secret::SerializableSecretString;
