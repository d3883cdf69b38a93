use std::fmt;

use chrono::{DateTime, Utc};
use tokio_postgres::types::PgLsn;

use crate::types::{TableName, Value};

/// Kind of row mutation captured from the change log.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Insert => f.write_str("insert"),
            Operation::Update => f.write_str("update"),
            Operation::Delete => f.write_str("delete"),
        }
    }
}

/// A named column value.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnValue {
    pub name: String,
    pub value: Value,
}

impl ColumnValue {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Ordered column values of one row image, in source column order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowImage {
    pub columns: Vec<ColumnValue>,
}

impl RowImage {
    pub fn new(columns: Vec<ColumnValue>) -> Self {
        Self { columns }
    }

    /// Returns the value of the column called `name`, if the image carries it.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|column| column.name == name)
            .map(|column| &column.value)
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// One captured row mutation, as decoded from a replication payload.
///
/// For deletes the after image is empty and the key columns live in `before`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Table the mutation happened in.
    pub table: TableName,
    pub operation: Operation,
    /// Row after the mutation.
    pub after: RowImage,
    /// Row identity before the mutation, when the source provided it.
    pub before: Option<RowImage>,
    /// Position of the payload in the change log.
    pub position: PgLsn,
    /// Sequence number, increasing within one streaming session.
    pub sequence: u64,
    /// Commit time of the transaction, when the payload carries it.
    pub commit_timestamp: Option<DateTime<Utc>>,
}

impl ChangeEvent {
    /// Returns the image holding the row's current column values.
    ///
    /// This is the before image for deletes and the after image otherwise.
    pub fn current_image(&self) -> &RowImage {
        match (self.operation, &self.before) {
            (Operation::Delete, Some(before)) => before,
            _ => &self.after,
        }
    }
}

/// A change event rewritten to the schema of its output stream.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedEvent {
    /// Name of the output stream, `schema-table`.
    pub stream_name: String,
    pub table: TableName,
    pub operation: Operation,
    /// Values in declared stream schema order, synthetic columns last.
    pub record: Vec<ColumnValue>,
    /// Values of the declared primary-key columns.
    pub key: Vec<Value>,
    pub position: PgLsn,
    pub sequence: u64,
}

impl RoutedEvent {
    /// Returns the value of the record field called `name`.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.record
            .iter()
            .find(|column| column.name == name)
            .map(|column| &column.value)
    }
}
