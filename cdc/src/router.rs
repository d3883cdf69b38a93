//! Routing of decoded change events to their output streams.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use tracing::debug;

use crate::error::{CdcResult, ErrorKind};
use crate::{bail, cdc_error};
use crate::types::{
    ChangeEvent, ColumnValue, DELETED_AT_COLUMN, LSN_COLUMN, Operation, RoutedEvent,
    StreamCatalogEntry, StreamSchema, TableName, Value,
};

/// Outcome of routing a single change event.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteResult {
    Routed(RoutedEvent),
    /// The event's table is not captured in this run.
    Dropped,
}

#[derive(Debug)]
struct Route {
    /// Index of the entry in the catalog.
    entry: usize,
    stream_name: String,
    schema: StreamSchema,
}

/// Maps change events to the enabled streams of a catalog.
///
/// The catalog is shared read-only, the router keeps no other state.
#[derive(Debug, Clone)]
pub struct Router {
    catalog: Arc<Vec<StreamCatalogEntry>>,
    routes: Arc<HashMap<TableName, Route>>,
}

impl Router {
    pub fn new(catalog: Arc<Vec<StreamCatalogEntry>>) -> Self {
        let routes = catalog
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.enabled)
            .map(|(index, entry)| {
                let route = Route {
                    entry: index,
                    stream_name: entry.stream_name(),
                    schema: entry.schema.clone().into_change_schema(),
                };
                (entry.table.clone(), route)
            })
            .collect();

        Self {
            catalog,
            routes: Arc::new(routes),
        }
    }

    /// Returns the enabled tables, in catalog order.
    pub fn enabled_tables(&self) -> Vec<TableName> {
        self.catalog
            .iter()
            .filter(|entry| entry.enabled)
            .map(|entry| entry.table.clone())
            .collect()
    }

    /// Returns the schema records of `table`'s stream conform to, if the table is captured.
    pub fn stream_schema(&self, table: &TableName) -> Option<&StreamSchema> {
        self.routes.get(table).map(|route| &route.schema)
    }

    /// Rewrites `event` to the schema of its stream.
    ///
    /// Columns the stream does not declare are dropped and declared columns missing from the
    /// event are null. Deletes get `_sdc_deleted_at` set to the commit time, or the current
    /// time when the payload had none. Every record carries its position in `_sdc_lsn`.
    pub fn route(&self, event: &ChangeEvent) -> CdcResult<RouteResult> {
        let Some(route) = self.routes.get(&event.table) else {
            debug!(table = %event.table, position = %event.position, "dropping event of table that is not captured");
            return Ok(RouteResult::Dropped);
        };
        let entry = &self.catalog[route.entry];

        let image = event.current_image();
        let position = i64::try_from(u64::from(event.position)).map_err(|err| {
            cdc_error!(
                ErrorKind::ConversionError,
                "Position does not fit a signed integer",
                event.position,
                source: err
            )
        })?;

        let mut record = Vec::with_capacity(route.schema.fields.len());
        for field in &route.schema.fields {
            let value = match field.name.as_str() {
                DELETED_AT_COLUMN => match event.operation {
                    Operation::Delete => {
                        let deleted_at = event.commit_timestamp.unwrap_or_else(Utc::now);
                        Value::Timestamp(deleted_at.to_rfc3339_opts(SecondsFormat::Secs, true))
                    }
                    _ => Value::Null,
                },
                LSN_COLUMN => Value::Integer(position),
                name => {
                    let value = image.get(name).cloned().unwrap_or(Value::Null);
                    let value_kind = value.kind();
                    match value.coerce_to(field.kind) {
                        Some(value) => value,
                        None => bail!(
                            ErrorKind::ValidationError,
                            "Column value does not match the stream schema",
                            format!(
                                "Column '{}' of {} is declared as {} but the event holds {:?}",
                                field.name, event.table, field.kind, value_kind
                            )
                        ),
                    }
                }
            };

            record.push(ColumnValue::new(field.name.clone(), value));
        }

        for column in &image.columns {
            if route.schema.field(&column.name).is_none() {
                debug!(table = %event.table, column = %column.name, "dropping column that is not in the stream schema");
            }
        }

        let key = entry
            .key_columns
            .iter()
            .map(|name| image.get(name).cloned().unwrap_or(Value::Null))
            .collect();

        Ok(RouteResult::Routed(RoutedEvent {
            stream_name: route.stream_name.clone(),
            table: event.table.clone(),
            operation: event.operation,
            record,
            key,
            position: event.position,
            sequence: event.sequence,
        }))
    }
}
