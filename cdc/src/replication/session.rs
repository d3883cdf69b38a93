use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use cdc_config::shared::PgConnectionConfig;
use cdc_postgres::replication::slots::validate_slot_name;
use futures::StreamExt;
use postgres_replication::protocol::ReplicationMessage;
use tokio_postgres::types::PgLsn;
use tracing::{debug, info};

use crate::bail;
use crate::error::{CdcResult, ErrorKind};
use crate::replication::client::{PgReplicationClient, SlotAction, check_slot};
use crate::replication::stream::WalStream;
use crate::types::TableName;

/// Outcome of a single read from the replication stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireRead {
    /// A wal2json payload starting at `position`.
    Chunk { position: PgLsn, data: Bytes },
    /// Nothing to decode: a keep-alive or the read timeout elapsed.
    Idle {
        /// End of the server's log as reported by a keep-alive.
        server_position: Option<PgLsn>,
    },
    /// The server ended the stream.
    Closed,
}

/// A streaming session attached to one replication slot.
pub trait SlotSession: Send {
    /// Position the session started streaming from.
    fn start_position(&self) -> PgLsn;

    /// Waits up to `timeout` for the next message of the stream.
    fn read_next(&mut self, timeout: Duration) -> impl Future<Output = CdcResult<WireRead>> + Send;

    /// Tells the server that everything up to `position` is durably stored, allowing it to
    /// release the log before it.
    fn acknowledge(&mut self, position: PgLsn) -> impl Future<Output = CdcResult<()>> + Send;

    /// Ends the session. The slot itself is kept.
    fn close(self) -> impl Future<Output = CdcResult<()>> + Send;
}

/// Opens sessions on replication slots.
pub trait SlotSource {
    type Session: SlotSession + 'static;

    /// Opens a session on `slot_name` streaming changes of `tables`.
    ///
    /// A missing slot is created when no `start` is given, and streaming begins at its
    /// consistent point. An existing slot is attached to at `start`, or at its confirmed
    /// position when `start` is `None`.
    fn open(
        &self,
        slot_name: &str,
        start: Option<PgLsn>,
        tables: &[TableName],
    ) -> impl Future<Output = CdcResult<Self::Session>> + Send;
}

/// Opens sessions against a Postgres server.
#[derive(Debug, Clone)]
pub struct PgSlotSource {
    pg_connection: PgConnectionConfig,
}

impl PgSlotSource {
    pub fn new(pg_connection: PgConnectionConfig) -> Self {
        Self { pg_connection }
    }
}

impl SlotSource for PgSlotSource {
    type Session = PgSlotSession;

    async fn open(
        &self,
        slot_name: &str,
        start: Option<PgLsn>,
        tables: &[TableName],
    ) -> CdcResult<PgSlotSession> {
        validate_slot_name(slot_name)?;

        let client = PgReplicationClient::connect(self.pg_connection.clone()).await?;
        let slot = client.get_slot(slot_name).await?;

        let start = match check_slot(slot_name, slot.as_ref(), start)? {
            SlotAction::Create => client.create_slot(slot_name).await?,
            SlotAction::Attach { start } => {
                info!(slot_name, %start, "attaching to existing replication slot");
                start
            }
        };

        let stream = client
            .start_wal2json_replication(slot_name, start, tables)
            .await?;
        let mut stream = Box::pin(WalStream::wrap(stream));

        // Releases the log before the resume point.
        stream
            .as_mut()
            .send_status_update(start, start, start, true)
            .await?;

        Ok(PgSlotSession {
            _client: client,
            stream,
            start,
            last_received: start,
            last_flushed: start,
        })
    }
}

/// A session streaming from a Postgres replication slot.
pub struct PgSlotSession {
    // Keeps the connection alive for the lifetime of the stream.
    _client: PgReplicationClient,
    stream: Pin<Box<WalStream>>,
    start: PgLsn,
    last_received: PgLsn,
    last_flushed: PgLsn,
}

impl SlotSession for PgSlotSession {
    fn start_position(&self) -> PgLsn {
        self.start
    }

    async fn read_next(&mut self, timeout: Duration) -> CdcResult<WireRead> {
        let message = match tokio::time::timeout(timeout, self.stream.next()).await {
            Ok(Some(message)) => message?,
            Ok(None) => return Ok(WireRead::Closed),
            Err(_) => {
                // Keeps the server informed while the log is quiet.
                self.stream
                    .as_mut()
                    .send_status_update(
                        self.last_received,
                        self.last_flushed,
                        self.last_flushed,
                        false,
                    )
                    .await?;

                return Ok(WireRead::Idle {
                    server_position: None,
                });
            }
        };

        match message {
            ReplicationMessage::XLogData(message) => {
                let position = PgLsn::from(message.wal_start());
                let end = PgLsn::from(message.wal_end());
                self.last_received = self.last_received.max(end);

                Ok(WireRead::Chunk {
                    position,
                    data: message.into_data(),
                })
            }
            ReplicationMessage::PrimaryKeepAlive(message) => {
                let wal_end = PgLsn::from(message.wal_end());
                let reply_requested = message.reply() == 1;
                debug!(%wal_end, reply_requested, "received keep alive");

                self.stream
                    .as_mut()
                    .send_status_update(
                        self.last_received,
                        self.last_flushed,
                        self.last_flushed,
                        reply_requested,
                    )
                    .await?;

                Ok(WireRead::Idle {
                    server_position: Some(wal_end),
                })
            }
            _ => Ok(WireRead::Idle {
                server_position: None,
            }),
        }
    }

    async fn acknowledge(&mut self, position: PgLsn) -> CdcResult<()> {
        self.last_flushed = position;
        let write = self.last_received.max(position);

        self.stream
            .as_mut()
            .send_status_update(write, position, position, true)
            .await
    }

    async fn close(self) -> CdcResult<()> {
        info!(last_flushed = %self.last_flushed, "closing replication session");

        Ok(())
    }
}

/// A session together with the positions read and acknowledged through it.
///
/// Enforces the acknowledgement contract of the slot: only positions that were read from this
/// session, never moving backwards.
#[derive(Debug)]
pub struct SessionState<S> {
    session: S,
    slot_name: String,
    last_read: PgLsn,
    last_flushed: PgLsn,
}

impl<S: SlotSession> SessionState<S> {
    pub fn new(slot_name: impl Into<String>, session: S) -> Self {
        let start = session.start_position();

        Self {
            session,
            slot_name: slot_name.into(),
            last_read: start,
            last_flushed: start,
        }
    }

    pub fn slot_name(&self) -> &str {
        &self.slot_name
    }

    pub fn start_position(&self) -> PgLsn {
        self.session.start_position()
    }

    /// Highest chunk position read so far.
    pub fn last_read(&self) -> PgLsn {
        self.last_read
    }

    pub fn last_flushed(&self) -> PgLsn {
        self.last_flushed
    }

    /// Reads the next message, recording the position of chunks.
    pub async fn read(&mut self, timeout: Duration) -> CdcResult<WireRead> {
        let read = self.session.read_next(timeout).await?;
        if let WireRead::Chunk { position, .. } = &read {
            self.last_read = self.last_read.max(*position);
        }

        Ok(read)
    }

    /// Acknowledges `position` to the server.
    ///
    /// Fails with [`ErrorKind::InvalidAcknowledgement`] when `position` is behind the last
    /// acknowledged position or beyond the last read one.
    pub async fn acknowledge(&mut self, position: PgLsn) -> CdcResult<()> {
        if position < self.last_flushed {
            bail!(
                ErrorKind::InvalidAcknowledgement,
                "Acknowledged position moves backwards",
                format!(
                    "Position {} is behind the acknowledged position {} of slot '{}'",
                    position, self.last_flushed, self.slot_name
                )
            );
        }

        if position > self.last_read {
            bail!(
                ErrorKind::InvalidAcknowledgement,
                "Acknowledged position was never read",
                format!(
                    "Position {} is beyond the last read position {} of slot '{}'",
                    position, self.last_read, self.slot_name
                )
            );
        }

        if position == self.last_flushed {
            return Ok(());
        }

        self.session.acknowledge(position).await?;
        self.last_flushed = position;

        Ok(())
    }

    pub async fn close(self) -> CdcResult<()> {
        self.session.close().await
    }
}
