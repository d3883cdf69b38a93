use serde::{Deserialize, Serialize};

use crate::bail;
use crate::error::{CdcResult, ErrorKind};
use crate::types::{ColumnValue, TableName, ValueKind};

/// Column holding the time a row was deleted, null for inserts and updates.
pub const DELETED_AT_COLUMN: &str = "_sdc_deleted_at";
/// Column holding the change log position of the event that produced the record.
pub const LSN_COLUMN: &str = "_sdc_lsn";

/// A single field of a stream schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    pub kind: ValueKind,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, kind: ValueKind, nullable: bool) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable,
        }
    }
}

/// Ordered field list that records of a stream conform to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSchema {
    pub fields: Vec<FieldSchema>,
}

impl StreamSchema {
    pub fn new(fields: Vec<FieldSchema>) -> Self {
        Self { fields }
    }

    /// Returns the schema that change-capture records of this stream conform to.
    ///
    /// Every field becomes nullable, since a delete only carries the key columns, and the
    /// synthetic delete marker and position fields are appended unless already declared.
    pub fn into_change_schema(mut self) -> StreamSchema {
        for field in &mut self.fields {
            field.nullable = true;
        }

        if self.field(DELETED_AT_COLUMN).is_none() {
            self.fields.push(FieldSchema::new(
                DELETED_AT_COLUMN,
                ValueKind::Timestamp,
                true,
            ));
        }
        if self.field(LSN_COLUMN).is_none() {
            self.fields
                .push(FieldSchema::new(LSN_COLUMN, ValueKind::Integer, true));
        }

        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Checks that `record` has exactly this schema's fields, in order, with matching kinds and
    /// nulls only where allowed.
    pub fn validate(&self, record: &[ColumnValue]) -> CdcResult<()> {
        if record.len() != self.fields.len() {
            bail!(
                ErrorKind::ValidationError,
                "Record does not match stream schema",
                format!(
                    "The record has {} fields but the schema declares {}",
                    record.len(),
                    self.fields.len()
                )
            );
        }

        for (field, column) in self.fields.iter().zip(record) {
            if field.name != column.name {
                bail!(
                    ErrorKind::ValidationError,
                    "Record does not match stream schema",
                    format!(
                        "Expected field '{}' but found '{}'",
                        field.name, column.name
                    )
                );
            }

            match column.value.kind() {
                None if !field.nullable => bail!(
                    ErrorKind::ValidationError,
                    "Null value in non-nullable field",
                    format!("Field '{}' is not nullable", field.name)
                ),
                Some(kind) if kind != field.kind => bail!(
                    ErrorKind::ValidationError,
                    "Value kind does not match stream schema",
                    format!(
                        "Field '{}' is declared as {} but holds a {} value",
                        field.name, field.kind, kind
                    )
                ),
                _ => {}
            }
        }

        Ok(())
    }
}

/// Capture settings of one source table, produced by catalog discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamCatalogEntry {
    pub table: TableName,
    /// Whether changes of this table are captured in this run.
    #[serde(default)]
    pub enabled: bool,
    /// Declared primary-key columns, in key order.
    #[serde(default)]
    pub key_columns: Vec<String>,
    pub schema: StreamSchema,
}

impl StreamCatalogEntry {
    pub fn new(table: TableName, key_columns: Vec<String>, schema: StreamSchema) -> Self {
        Self {
            table,
            enabled: true,
            key_columns,
            schema,
        }
    }

    pub fn stream_name(&self) -> String {
        self.table.stream_name()
    }
}
