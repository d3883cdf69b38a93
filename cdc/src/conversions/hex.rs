use std::fmt::Write;

use crate::bail;
use crate::error::{CdcResult, ErrorKind};

/// Parses Postgres's hex `bytea` output (`\x` followed by pairs of hex digits) into bytes.
pub fn parse_bytea_hex(bytea_hex_string: &str) -> CdcResult<Vec<u8>> {
    let Some(digits) = bytea_hex_string.strip_prefix("\\x") else {
        bail!(
            ErrorKind::ConversionError,
            "Could not convert from bytea hex string to byte array",
            "The prefix '\\x' is missing"
        );
    };

    if digits.len() % 2 != 0 {
        bail!(
            ErrorKind::ConversionError,
            "Could not convert from bytea hex string to byte array",
            "The number of digits is odd"
        );
    }

    let mut result = Vec::with_capacity(digits.len() / 2);
    for i in (0..digits.len()).step_by(2) {
        let Some(pair) = digits.get(i..i + 2) else {
            bail!(
                ErrorKind::ConversionError,
                "Could not convert from bytea hex string to byte array",
                "The string contains non-ASCII characters"
            );
        };
        result.push(u8::from_str_radix(pair, 16)?);
    }

    Ok(result)
}

/// Renders bytes as lowercase hex without a prefix.
pub fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        // Writing to a String cannot fail.
        let _ = write!(out, "{byte:02x}");
    }

    out
}
