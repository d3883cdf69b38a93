use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_postgres::types::PgLsn;
use tracing::{debug, info};

use crate::destination::Destination;
use crate::error::CdcResult;
use crate::types::{ColumnValue, Operation, RoutedEvent, Value};

/// Latest state of one row, as materialized from the change stream.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterializedRow {
    pub record: Vec<ColumnValue>,
    pub deleted: bool,
    pub position: PgLsn,
    pub sequence: u64,
}

#[derive(Debug, Default)]
struct Inner {
    events: Vec<RoutedEvent>,
    rows: HashMap<(String, String), MaterializedRow>,
}

/// In-memory destination for tests and development.
///
/// Keeps the raw log of every written event and a materialized view of the latest row per
/// stream and primary key. An event only replaces a row when it is newer, comparing position
/// first and sequence within the same position, so replayed events leave the view unchanged.
#[derive(Debug, Clone, Default)]
pub struct MemoryDestination {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all events written so far, duplicates included.
    pub async fn events(&self) -> Vec<RoutedEvent> {
        let inner = self.inner.lock().await;
        inner.events.clone()
    }

    /// Returns the materialized row of `stream_name` with primary key `key`.
    pub async fn row(&self, stream_name: &str, key: &[Value]) -> Option<MaterializedRow> {
        let inner = self.inner.lock().await;
        inner
            .rows
            .get(&(stream_name.to_string(), row_key(key)))
            .cloned()
    }

    /// Returns the number of materialized rows, deleted ones included.
    pub async fn rows_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.rows.len()
    }
}

fn row_key(key: &[Value]) -> String {
    format!("{key:?}")
}

impl Destination for MemoryDestination {
    fn name() -> &'static str {
        "memory"
    }

    async fn write_events(&self, events: Vec<RoutedEvent>) -> CdcResult<()> {
        let mut inner = self.inner.lock().await;

        info!(count = events.len(), "writing a batch of events");

        for event in &events {
            let row_key = (event.stream_name.clone(), row_key(&event.key));
            let is_newer = inner.rows.get(&row_key).is_none_or(|row| {
                (event.position, event.sequence) > (row.position, row.sequence)
            });

            if !is_newer {
                debug!(stream = %event.stream_name, position = %event.position, "ignoring replayed event");
                continue;
            }

            inner.rows.insert(
                row_key,
                MaterializedRow {
                    record: event.record.clone(),
                    deleted: event.operation == Operation::Delete,
                    position: event.position,
                    sequence: event.sequence,
                },
            );
        }
        inner.events.extend(events);

        Ok(())
    }
}
