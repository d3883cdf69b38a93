use chrono::{DateTime, Utc};
use tokio_postgres::types::PgLsn;
use tracing::{debug, warn};

use crate::conversions::value::{map_value, parse_commit_timestamp};
use crate::conversions::wal2json::{Change, Column, OldKeys, Payload};
use crate::error::{CdcResult, ErrorKind};
use crate::types::{ChangeEvent, ColumnValue, Operation, RowImage, TableName};
use crate::{bail, cdc_error};

/// Decodes one wal2json payload read at `position` into change events.
///
/// Both format versions are accepted. Transaction boundaries, truncates and logical messages
/// produce no events. Every produced event takes the next value of `sequence`.
///
/// Fails with [`ErrorKind::MalformedPayload`] when the payload is not valid JSON or does not
/// have the structure of a wal2json change record.
pub fn decode_payload(
    position: PgLsn,
    payload: &[u8],
    sequence: &mut u64,
) -> CdcResult<Vec<ChangeEvent>> {
    let payload: Payload = serde_json::from_slice(payload).map_err(|err| {
        cdc_error!(
            ErrorKind::MalformedPayload,
            "Replication payload is not a wal2json record",
            err.to_string(),
            source: err
        )
    })?;

    let commit_timestamp = payload.timestamp.as_deref().and_then(|timestamp| {
        parse_commit_timestamp(timestamp)
            .inspect_err(|err| {
                warn!(%position, error = %err, "ignoring unparseable commit timestamp");
            })
            .ok()
    });

    let mut decoder = Decoder {
        position,
        commit_timestamp,
        sequence,
        events: Vec::new(),
    };

    match payload.change {
        Some(ref changes) => {
            for change in changes {
                decoder.decode_v1_change(change)?;
            }
        }
        None => decoder.decode_v2_payload(&payload)?,
    }

    Ok(decoder.events)
}

struct Decoder<'a> {
    position: PgLsn,
    commit_timestamp: Option<DateTime<Utc>>,
    sequence: &'a mut u64,
    events: Vec<ChangeEvent>,
}

impl Decoder<'_> {
    fn decode_v2_payload(&mut self, payload: &Payload) -> CdcResult<()> {
        let Some(action) = payload.action.as_deref() else {
            bail!(
                ErrorKind::MalformedPayload,
                "Replication payload has no action",
                format!("The payload at {} has neither 'action' nor 'change'", self.position)
            );
        };

        match action {
            "I" | "U" | "D" => {
                let table = table_name(payload.schema.as_deref(), payload.table.as_deref())?;
                let identity = image_from_columns(&payload.identity)?;

                let (operation, after, before) = match action {
                    "I" => (Operation::Insert, image_from_columns(&payload.columns)?, None),
                    "U" => (
                        Operation::Update,
                        image_from_columns(&payload.columns)?,
                        (!identity.is_empty()).then_some(identity),
                    ),
                    _ => (Operation::Delete, RowImage::default(), Some(identity)),
                };

                self.push(table, operation, after, before);
            }
            "B" | "C" => {}
            "T" => debug!(position = %self.position, "skipping truncate, it is not captured"),
            "M" => debug!(position = %self.position, "skipping logical decoding message"),
            other => bail!(
                ErrorKind::MalformedPayload,
                "Unknown wal2json action",
                format!("Action '{other}' at {} is not a known action", self.position)
            ),
        }

        Ok(())
    }

    fn decode_v1_change(&mut self, change: &Change) -> CdcResult<()> {
        let operation = match change.kind.as_str() {
            "insert" => Operation::Insert,
            "update" => Operation::Update,
            "delete" => Operation::Delete,
            "message" => {
                debug!(position = %self.position, "skipping logical decoding message");
                return Ok(());
            }
            other => bail!(
                ErrorKind::MalformedPayload,
                "Unknown wal2json change kind",
                format!("Kind '{other}' at {} is not a known kind", self.position)
            ),
        };

        let table = table_name(change.schema.as_deref(), change.table.as_deref())?;
        let before = change.oldkeys.as_ref().map(image_from_old_keys).transpose()?;

        let after = match operation {
            Operation::Delete => RowImage::default(),
            _ => image_from_arrays(
                &change.columnnames,
                &change.columntypes,
                &change.columnvalues,
            )?,
        };
        let before = match operation {
            Operation::Insert => None,
            Operation::Update => before,
            Operation::Delete => Some(before.unwrap_or_default()),
        };

        self.push(table, operation, after, before);

        Ok(())
    }

    fn push(
        &mut self,
        table: TableName,
        operation: Operation,
        after: RowImage,
        before: Option<RowImage>,
    ) {
        let sequence = *self.sequence;
        *self.sequence += 1;

        self.events.push(ChangeEvent {
            table,
            operation,
            after,
            before,
            position: self.position,
            sequence,
            commit_timestamp: self.commit_timestamp,
        });
    }
}

fn table_name(schema: Option<&str>, table: Option<&str>) -> CdcResult<TableName> {
    match (schema, table) {
        (Some(schema), Some(table)) => Ok(TableName::new(schema, table)),
        _ => bail!(
            ErrorKind::MalformedPayload,
            "Row change has no table",
            "The 'schema' and 'table' fields are required for row changes"
        ),
    }
}

fn image_from_columns(columns: &[Column]) -> CdcResult<RowImage> {
    let mut image = Vec::with_capacity(columns.len());
    for column in columns {
        let value = map_value(column.type_name.as_deref(), &column.value)?;
        image.push(ColumnValue::new(column.name.clone(), value));
    }

    Ok(RowImage::new(image))
}

fn image_from_old_keys(old_keys: &OldKeys) -> CdcResult<RowImage> {
    image_from_arrays(&old_keys.keynames, &old_keys.keytypes, &old_keys.keyvalues)
}

fn image_from_arrays(
    names: &[String],
    types: &[String],
    values: &[Box<serde_json::value::RawValue>],
) -> CdcResult<RowImage> {
    if names.len() != values.len() || (!types.is_empty() && types.len() != names.len()) {
        bail!(
            ErrorKind::MalformedPayload,
            "Column arrays of a change have different lengths",
            format!(
                "{} names, {} types and {} values",
                names.len(),
                types.len(),
                values.len()
            )
        );
    }

    let mut image = Vec::with_capacity(names.len());
    for (index, (name, raw)) in names.iter().zip(values).enumerate() {
        let type_name = types.get(index).map(String::as_str);
        image.push(ColumnValue::new(name.clone(), map_value(type_name, raw)?));
    }

    Ok(RowImage::new(image))
}
