use crate::bail;
use crate::error::{CdcResult, ErrorKind};

/// Parses a Postgres boolean in text form.
///
/// Accepts the `t`/`f` output format as well as `true`/`false`.
pub fn parse_bool(s: &str) -> CdcResult<bool> {
    match s {
        "t" | "true" => Ok(true),
        "f" | "false" => Ok(false),
        _ => bail!(
            ErrorKind::ConversionError,
            "Invalid boolean value",
            format!("Boolean value must be 't', 'f', 'true' or 'false' (received: {s})")
        ),
    }
}
