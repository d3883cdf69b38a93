use crate::types::{FieldSchema, StreamCatalogEntry, StreamSchema, TableName, ValueKind};

/// `public.users(id integer primary key, name text)`.
pub fn users_entry() -> StreamCatalogEntry {
    StreamCatalogEntry::new(
        TableName::new("public", "users"),
        vec!["id".to_string()],
        StreamSchema::new(vec![
            FieldSchema::new("id", ValueKind::Integer, false),
            FieldSchema::new("name", ValueKind::Text, true),
        ]),
    )
}

/// `public.orders(id integer primary key, amount numeric)`.
pub fn orders_entry() -> StreamCatalogEntry {
    StreamCatalogEntry::new(
        TableName::new("public", "orders"),
        vec!["id".to_string()],
        StreamSchema::new(vec![
            FieldSchema::new("id", ValueKind::Integer, false),
            FieldSchema::new("amount", ValueKind::Decimal, true),
        ]),
    )
}

/// Returns `entry` excluded from capture.
pub fn disabled(mut entry: StreamCatalogEntry) -> StreamCatalogEntry {
    entry.enabled = false;
    entry
}
