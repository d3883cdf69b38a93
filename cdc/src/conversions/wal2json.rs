//! Wire structures of the wal2json output plugin.
//!
//! Format version 2 sends one object per row change, version 1 one object per transaction
//! with its row changes in a `change` array. Both are read through [`Payload`], and fields
//! this engine does not use are ignored.

use serde::Deserialize;
use serde_json::value::RawValue;

#[derive(Debug, Deserialize)]
pub(super) struct Payload {
    /// Version 2 action: `B`, `C`, `I`, `U`, `D`, `T` or `M`.
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub columns: Vec<Column>,
    #[serde(default)]
    pub identity: Vec<Column>,
    /// Commit time, present with `include-timestamp`.
    #[serde(default)]
    pub timestamp: Option<String>,
    /// Version 1 changes of a transaction.
    #[serde(default)]
    pub change: Option<Vec<Change>>,
}

#[derive(Debug, Deserialize)]
pub(super) struct Column {
    pub name: String,
    #[serde(default, rename = "type")]
    pub type_name: Option<String>,
    pub value: Box<RawValue>,
}

#[derive(Debug, Deserialize)]
pub(super) struct Change {
    pub kind: String,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub columnnames: Vec<String>,
    #[serde(default)]
    pub columntypes: Vec<String>,
    #[serde(default)]
    pub columnvalues: Vec<Box<RawValue>>,
    #[serde(default)]
    pub oldkeys: Option<OldKeys>,
}

#[derive(Debug, Deserialize)]
pub(super) struct OldKeys {
    #[serde(default)]
    pub keynames: Vec<String>,
    #[serde(default)]
    pub keytypes: Vec<String>,
    #[serde(default)]
    pub keyvalues: Vec<Box<RawValue>>,
}
