//! wal2json format version 2 payloads, as produced with `include-types` and
//! `include-timestamp`.

use bytes::Bytes;
use serde_json::{Value as JsonValue, json};

/// Commit time attached to every built row payload.
pub const COMMIT_TIMESTAMP: &str = "2024-03-01 12:30:45.123456+00";

/// A column as `(name, type, value)`.
pub type Column<'a> = (&'a str, &'a str, JsonValue);

fn columns(columns: &[Column<'_>]) -> JsonValue {
    JsonValue::Array(
        columns
            .iter()
            .map(|(name, type_name, value)| {
                json!({ "name": name, "type": type_name, "value": value })
            })
            .collect(),
    )
}

fn to_bytes(payload: JsonValue) -> Bytes {
    Bytes::from(payload.to_string())
}

pub fn insert(schema: &str, table: &str, row: &[Column<'_>]) -> Bytes {
    to_bytes(json!({
        "action": "I",
        "timestamp": COMMIT_TIMESTAMP,
        "schema": schema,
        "table": table,
        "columns": columns(row),
    }))
}

pub fn update(schema: &str, table: &str, row: &[Column<'_>], identity: &[Column<'_>]) -> Bytes {
    to_bytes(json!({
        "action": "U",
        "timestamp": COMMIT_TIMESTAMP,
        "schema": schema,
        "table": table,
        "columns": columns(row),
        "identity": columns(identity),
    }))
}

pub fn delete(schema: &str, table: &str, identity: &[Column<'_>]) -> Bytes {
    to_bytes(json!({
        "action": "D",
        "timestamp": COMMIT_TIMESTAMP,
        "schema": schema,
        "table": table,
        "identity": columns(identity),
    }))
}

pub fn begin() -> Bytes {
    to_bytes(json!({ "action": "B" }))
}

pub fn commit() -> Bytes {
    to_bytes(json!({ "action": "C" }))
}

/// Insert of a `public.users` row with an integer `id` and a text `name`.
pub fn insert_user(id: i64, name: &str) -> Bytes {
    insert(
        "public",
        "users",
        &[("id", "integer", json!(id)), ("name", "text", json!(name))],
    )
}

/// Update of the `public.users` row `id`.
pub fn update_user(id: i64, name: &str) -> Bytes {
    update(
        "public",
        "users",
        &[("id", "integer", json!(id)), ("name", "text", json!(name))],
        &[("id", "integer", json!(id))],
    )
}

/// Delete of the `public.users` row `id`.
pub fn delete_user(id: i64) -> Bytes {
    delete("public", "users", &[("id", "integer", json!(id))])
}
