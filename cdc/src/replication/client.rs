use std::fmt;
use std::io::BufReader;
use std::sync::Arc;

use cdc_config::shared::PgConnectionConfig;
use cdc_postgres::replication::slots::WAL2JSON_PLUGIN;
use cdc_postgres::types::TableName;
use pg_escape::{quote_identifier, quote_literal};
use postgres_replication::ReplicationStream;
use rustls::ClientConfig;
use tokio_postgres::error::SqlState;
use tokio_postgres::tls::MakeTlsConnect;
use tokio_postgres::{
    Client, Config, Connection, NoTls, SimpleQueryMessage, SimpleQueryRow, Socket,
    config::ReplicationMode, types::PgLsn,
};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{Instrument, error, info};

use crate::conversions::bool::parse_bool;
use crate::error::{CdcResult, ErrorKind};
use crate::{bail, cdc_error};

/// Spawns a background task driving a Postgres connection until it terminates.
fn spawn_postgres_connection<T>(connection: Connection<Socket, T::Stream>)
where
    T: MakeTlsConnect<Socket>,
    T::Stream: Send + 'static,
{
    let span = tracing::Span::current();
    let task = async move {
        match connection.await {
            Err(err) => error!("an error occurred during the postgres connection: {}", err),
            Ok(()) => info!("postgres connection terminated successfully"),
        }
    }
    .instrument(span);

    // The connection terminates once the owning `Client` is dropped.
    tokio::spawn(task);
}

/// A row of `pg_replication_slots` for a single slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    /// Output plugin, `None` for physical slots.
    pub plugin: Option<String>,
    /// `logical` or `physical`.
    pub slot_type: String,
    /// Whether a walsender is currently attached to the slot.
    pub active: bool,
    /// Position up to which the consumer confirmed changes, `None` until the first confirmation
    /// of a freshly created slot.
    pub confirmed_flush_lsn: Option<PgLsn>,
}

impl SlotInfo {
    fn is_wal2json_logical(&self) -> bool {
        self.slot_type == "logical" && self.plugin.as_deref() == Some(WAL2JSON_PLUGIN)
    }
}

/// What to do with the slot before streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotAction {
    /// The slot does not exist and must be created; streaming starts at its consistent point.
    Create,
    /// Attach to the existing slot and stream from `start`.
    Attach { start: PgLsn },
}

/// Validates a slot lookup against the requested start position.
///
/// A missing slot can only be created when no start position was requested, since a new slot
/// retains nothing before its consistent point. A requested position older than what the slot
/// confirmed is no longer retained by the server.
pub fn check_slot(
    slot_name: &str,
    slot: Option<&SlotInfo>,
    start: Option<PgLsn>,
) -> CdcResult<SlotAction> {
    let Some(slot) = slot else {
        if let Some(start) = start {
            bail!(
                ErrorKind::PositionUnavailable,
                "Replication slot is missing",
                format!(
                    "Replication slot '{slot_name}' does not exist, position {start} cannot be resumed"
                )
            );
        }

        return Ok(SlotAction::Create);
    };

    if !slot.is_wal2json_logical() {
        bail!(
            ErrorKind::SlotIncompatible,
            "Replication slot is not a wal2json logical slot",
            format!(
                "Replication slot '{}' has type '{}' and plugin '{}'",
                slot_name,
                slot.slot_type,
                slot.plugin.as_deref().unwrap_or("none")
            )
        );
    }

    if slot.active {
        bail!(
            ErrorKind::SlotBusy,
            "Replication slot is in use",
            format!("Replication slot '{slot_name}' is active in another session")
        );
    }

    let confirmed = slot.confirmed_flush_lsn.unwrap_or(PgLsn::from(0));
    match start {
        None => Ok(SlotAction::Attach { start: confirmed }),
        Some(start) if start < confirmed => {
            bail!(
                ErrorKind::PositionUnavailable,
                "Requested position is no longer retained by the slot",
                format!(
                    "Replication slot '{slot_name}' confirmed {confirmed}, position {start} was released"
                )
            );
        }
        Some(start) => Ok(SlotAction::Attach { start }),
    }
}

/// Builds the wal2json option list of `START_REPLICATION`.
///
/// `add-tables` is omitted when no table is selected, which makes the plugin emit every table.
pub fn wal2json_options(tables: &[TableName]) -> String {
    let mut options = vec![
        r#""format-version" '2'"#.to_string(),
        r#""include-transaction" 'false'"#.to_string(),
        r#""include-lsn" 'true'"#.to_string(),
        r#""include-timestamp" 'true'"#.to_string(),
        r#""include-types" 'true'"#.to_string(),
    ];

    if !tables.is_empty() {
        let filter = tables
            .iter()
            .map(TableName::as_wal2json_filter)
            .collect::<Vec<_>>()
            .join(",");
        options.push(format!(r#""add-tables" {}"#, quote_literal(&filter)));
    }

    format!("({})", options.join(", "))
}

/// A client for the replication protocol features the engine uses.
#[derive(Debug, Clone)]
pub struct PgReplicationClient {
    client: Arc<Client>,
}

impl PgReplicationClient {
    /// Connects to Postgres in logical replication mode, with TLS when enabled in
    /// `pg_connection_config`.
    pub async fn connect(pg_connection_config: PgConnectionConfig) -> CdcResult<Self> {
        match pg_connection_config.tls.enabled {
            true => PgReplicationClient::connect_tls(pg_connection_config).await,
            false => PgReplicationClient::connect_no_tls(pg_connection_config).await,
        }
    }

    async fn connect_no_tls(pg_connection_config: PgConnectionConfig) -> CdcResult<Self> {
        let mut config: Config = pg_connection_config.connect_options();
        config.replication_mode(ReplicationMode::Logical);

        let (client, connection) = config.connect(NoTls).await?;
        spawn_postgres_connection::<NoTls>(connection);

        info!("successfully connected to postgres without tls");

        Ok(PgReplicationClient {
            client: Arc::new(client),
        })
    }

    async fn connect_tls(pg_connection_config: PgConnectionConfig) -> CdcResult<Self> {
        let mut config: Config = pg_connection_config.connect_options();
        config.replication_mode(ReplicationMode::Logical);

        let mut root_store = rustls::RootCertStore::empty();
        let mut root_certs_reader =
            BufReader::new(pg_connection_config.tls.trusted_root_certs.as_bytes());
        for cert in rustls_pemfile::certs(&mut root_certs_reader) {
            let cert = cert?;
            root_store.add(cert)?;
        }

        let tls_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let (client, connection) = config.connect(MakeRustlsConnect::new(tls_config)).await?;
        spawn_postgres_connection::<MakeRustlsConnect>(connection);

        info!("successfully connected to postgres with tls");

        Ok(PgReplicationClient {
            client: Arc::new(client),
        })
    }

    /// Looks the slot up in `pg_replication_slots`, returning `None` when it does not exist.
    pub async fn get_slot(&self, slot_name: &str) -> CdcResult<Option<SlotInfo>> {
        let query = format!(
            r#"select plugin, slot_type, active, confirmed_flush_lsn from pg_replication_slots where slot_name = {};"#,
            quote_literal(slot_name)
        );

        let results = self.client.simple_query(&query).await?;
        for result in results {
            if let SimpleQueryMessage::Row(row) = result {
                let plugin = row.try_get("plugin")?.map(str::to_string);
                let slot_type =
                    Self::get_row_value::<String>(&row, "slot_type", "pg_replication_slots")?;
                let active = Self::get_row_value::<String>(&row, "active", "pg_replication_slots")?;
                let confirmed_flush_lsn = match row.try_get("confirmed_flush_lsn")? {
                    Some(_) => Some(Self::get_row_value::<PgLsn>(
                        &row,
                        "confirmed_flush_lsn",
                        "pg_replication_slots",
                    )?),
                    None => None,
                };

                return Ok(Some(SlotInfo {
                    plugin,
                    slot_type,
                    active: parse_bool(&active)?,
                    confirmed_flush_lsn,
                }));
            }
        }

        Ok(None)
    }

    /// Creates a wal2json logical slot without exporting a snapshot and returns its consistent
    /// point.
    pub async fn create_slot(&self, slot_name: &str) -> CdcResult<PgLsn> {
        // Replication commands must stay upper case, the walsender's lexer does not accept
        // lower case keywords.
        let query = format!(
            r#"CREATE_REPLICATION_SLOT {} LOGICAL {} NOEXPORT_SNAPSHOT"#,
            quote_identifier(slot_name),
            WAL2JSON_PLUGIN
        );

        match self.client.simple_query(&query).await {
            Ok(results) => {
                for result in results {
                    if let SimpleQueryMessage::Row(row) = result {
                        let consistent_point = Self::get_row_value::<PgLsn>(
                            &row,
                            "consistent_point",
                            "pg_replication_slots",
                        )?;
                        info!(slot_name, %consistent_point, "created replication slot");

                        return Ok(consistent_point);
                    }
                }
            }
            Err(err) => {
                if let Some(code) = err.code()
                    && *code == SqlState::DUPLICATE_OBJECT
                {
                    bail!(
                        ErrorKind::SlotAlreadyExists,
                        "Replication slot already exists",
                        format!("Replication slot '{slot_name}' already exists in database")
                    );
                }

                return Err(err.into());
            }
        }

        Err(cdc_error!(
            ErrorKind::SlotNotCreated,
            "Replication slot creation failed"
        ))
    }

    /// Starts streaming wal2json payloads of `tables` from `slot_name` at `start_lsn`.
    pub async fn start_wal2json_replication(
        &self,
        slot_name: &str,
        start_lsn: PgLsn,
        tables: &[TableName],
    ) -> CdcResult<ReplicationStream> {
        info!(
            "starting wal2json replication with slot named '{}' at lsn {}",
            slot_name, start_lsn
        );

        let query = format!(
            r#"START_REPLICATION SLOT {} LOGICAL {} {}"#,
            quote_identifier(slot_name),
            start_lsn,
            wal2json_options(tables)
        );

        let copy_stream = self.client.copy_both_simple::<bytes::Bytes>(&query).await?;

        Ok(ReplicationStream::new(copy_stream))
    }

    /// Extracts and parses a non null column of a simple query row.
    fn get_row_value<T: std::str::FromStr>(
        row: &SimpleQueryRow,
        column_name: &str,
        table_name: &str,
    ) -> CdcResult<T>
    where
        T::Err: fmt::Debug,
    {
        let value = row.try_get(column_name)?.ok_or(cdc_error!(
            ErrorKind::InvalidData,
            "Column value is missing",
            format!("Column '{column_name}' of '{table_name}' is null or missing")
        ))?;

        value.parse().map_err(|e: T::Err| {
            cdc_error!(
                ErrorKind::ConversionError,
                "Column parsing failed",
                format!(
                    "Failed to parse value from column '{column_name}' in table '{table_name}': {e:?}"
                )
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(active: bool, confirmed: Option<u64>) -> SlotInfo {
        SlotInfo {
            plugin: Some("wal2json".to_string()),
            slot_type: "logical".to_string(),
            active,
            confirmed_flush_lsn: confirmed.map(PgLsn::from),
        }
    }

    #[test]
    fn missing_slot_is_created_only_without_start() {
        assert_eq!(
            check_slot("tappostgres", None, None).unwrap(),
            SlotAction::Create
        );

        let err = check_slot("tappostgres", None, Some(PgLsn::from(100))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PositionUnavailable);
    }

    #[test]
    fn attaches_at_confirmed_flush_without_start() {
        let action = check_slot("tappostgres", Some(&slot(false, Some(100))), None).unwrap();
        assert_eq!(
            action,
            SlotAction::Attach {
                start: PgLsn::from(100)
            }
        );

        let action = check_slot("tappostgres", Some(&slot(false, None)), None).unwrap();
        assert_eq!(
            action,
            SlotAction::Attach {
                start: PgLsn::from(0)
            }
        );
    }

    #[test]
    fn attaches_at_requested_start_when_retained() {
        let action = check_slot(
            "tappostgres",
            Some(&slot(false, Some(100))),
            Some(PgLsn::from(120)),
        )
        .unwrap();
        assert_eq!(
            action,
            SlotAction::Attach {
                start: PgLsn::from(120)
            }
        );

        let err = check_slot(
            "tappostgres",
            Some(&slot(false, Some(100))),
            Some(PgLsn::from(90)),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PositionUnavailable);
    }

    #[test]
    fn rejects_active_and_incompatible_slots() {
        let err = check_slot("tappostgres", Some(&slot(true, Some(100))), None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SlotBusy);

        let pgoutput = SlotInfo {
            plugin: Some("pgoutput".to_string()),
            ..slot(false, Some(100))
        };
        let err = check_slot("tappostgres", Some(&pgoutput), None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SlotIncompatible);

        let physical = SlotInfo {
            plugin: None,
            slot_type: "physical".to_string(),
            ..slot(false, None)
        };
        let err = check_slot("tappostgres", Some(&physical), None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SlotIncompatible);
    }

    #[test]
    fn options_include_table_filter() {
        let options = wal2json_options(&[
            TableName::new("public", "users"),
            TableName::new("sales", "orders"),
        ]);

        assert_eq!(
            options,
            r#"("format-version" '2', "include-transaction" 'false', "include-lsn" 'true', "include-timestamp" 'true', "include-types" 'true', "add-tables" 'public.users,sales.orders')"#
        );
    }

    #[test]
    fn options_omit_empty_table_filter() {
        let options = wal2json_options(&[]);

        assert!(!options.contains("add-tables"));
        assert!(options.starts_with(r#"("format-version" '2'"#));
    }
}
