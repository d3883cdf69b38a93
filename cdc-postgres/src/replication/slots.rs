use thiserror::Error;

/// Maximum length for a Postgres replication slot name in bytes.
pub const MAX_SLOT_NAME_LENGTH: usize = 63;

/// Name of the logical decoding plugin the engine streams with.
pub const WAL2JSON_PLUGIN: &str = "wal2json";

/// Error type for slot name validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlotNameError {
    #[error("Invalid slot name length: {0}")]
    InvalidSlotNameLength(String),

    #[error("Invalid slot name: {0}")]
    InvalidSlotName(String),
}

/// Checks that `slot_name` is accepted by Postgres as a replication slot name.
///
/// Postgres allows lower case letters, digits and underscores, up to
/// [`MAX_SLOT_NAME_LENGTH`] bytes.
pub fn validate_slot_name(slot_name: &str) -> Result<(), SlotNameError> {
    if slot_name.is_empty() {
        return Err(SlotNameError::InvalidSlotName(slot_name.to_string()));
    }

    if slot_name.len() > MAX_SLOT_NAME_LENGTH {
        return Err(SlotNameError::InvalidSlotNameLength(slot_name.to_string()));
    }

    let valid = slot_name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_');
    if !valid {
        return Err(SlotNameError::InvalidSlotName(slot_name.to_string()));
    }

    Ok(())
}
