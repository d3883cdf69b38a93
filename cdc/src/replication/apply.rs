//! The streaming loop of one replication session.
//!
//! A session runs two futures joined on the same task. The reader pulls payloads from the slot,
//! decodes and routes them and pushes one batch per payload into a bounded queue. The emitter
//! writes batches to the destination, advances the position tracker and takes checkpoints.
//! Checkpoint positions flow back to the reader, which acknowledges them to the server between
//! two reads.
//!
//! ```text
//!  slot ──read──▶ reader ──batches (bounded)──▶ emitter ──▶ destination
//!                   ▲                              │
//!                   └──────── acknowledgements ◀───┴──▶ state store
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use cdc_config::shared::{CdcConfig, CheckpointConfig};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::Instant;
use tokio_postgres::types::PgLsn;
use tracing::{debug, info};

use crate::bail;
use crate::concurrency::shutdown::ShutdownRx;
use crate::concurrency::timer::DeferredTimer;
use crate::conversions::event::decode_payload;
use crate::destination::Destination;
use crate::error::{CdcResult, ErrorKind};
use crate::replication::session::{SessionState, SlotSession, WireRead};
use crate::router::{RouteResult, Router};
use crate::state::position::PositionTracker;
use crate::store::state::{Checkpoint, StateStore};
use crate::types::RoutedEvent;

/// Routed events of one payload together with the payload's position.
///
/// Empty batches are sent too, so that positions of payloads carrying only dropped tables or
/// transaction markers still advance.
#[derive(Debug)]
struct Batch {
    position: PgLsn,
    events: Vec<RoutedEvent>,
}

/// Why a session stopped without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    /// The server ended the stream.
    Closed,
    /// Shutdown was requested.
    Shutdown,
    /// No wire data arrived for the configured idle period.
    IdleStop,
}

/// Result of [`run_session`], handing the session back to the caller.
#[derive(Debug)]
pub struct SessionOutcome<S> {
    pub session: SessionState<S>,
    pub result: CdcResult<SessionExit>,
    /// Whether at least one payload was read during the session.
    pub made_progress: bool,
}

/// Persists checkpoints of one slot, skipping positions that are already stored.
#[derive(Debug)]
pub struct CheckpointWriter<St> {
    store: St,
    slot_name: String,
    streams: BTreeSet<String>,
    last_persisted: Option<PgLsn>,
}

impl<St: StateStore> CheckpointWriter<St> {
    pub fn new(
        store: St,
        slot_name: impl Into<String>,
        streams: BTreeSet<String>,
        last_persisted: Option<PgLsn>,
    ) -> Self {
        Self {
            store,
            slot_name: slot_name.into(),
            streams,
            last_persisted,
        }
    }

    /// Takes a checkpoint from `tracker` and stores it.
    ///
    /// Returns the position when it was newly persisted, `None` when it already was.
    pub async fn write(&mut self, tracker: &Mutex<PositionTracker>) -> CdcResult<Option<PgLsn>> {
        let position = tracker.lock().await.checkpoint();
        if self.last_persisted == Some(position) {
            return Ok(None);
        }

        self.store
            .store_checkpoint(
                &self.slot_name,
                Checkpoint::new(position, self.streams.clone()),
            )
            .await?;
        self.last_persisted = Some(position);

        debug!(slot_name = %self.slot_name, %position, "checkpoint persisted");

        Ok(Some(position))
    }
}

/// Everything a session needs besides the slot itself.
#[derive(Debug)]
pub struct ApplyContext<D, St> {
    pub config: Arc<CdcConfig>,
    pub router: Router,
    pub destination: D,
    pub checkpoints: CheckpointWriter<St>,
    /// Next event sequence number, kept across sessions.
    pub sequence: u64,
}

/// Streams from `session` until the server closes it, shutdown is requested, the idle limit is
/// hit or an error occurs.
///
/// Events are written in wire order. A checkpoint is taken every
/// [`CheckpointConfig::max_events`] events or [`CheckpointConfig::max_interval`] after the
/// first unpersisted batch, persisted and then acknowledged. No final checkpoint is taken here.
pub async fn run_session<S, D, St>(
    mut session: SessionState<S>,
    ctx: &mut ApplyContext<D, St>,
    tracker: &Mutex<PositionTracker>,
    shutdown_rx: ShutdownRx,
) -> SessionOutcome<S>
where
    S: SlotSession,
    D: Destination + Sync,
    St: StateStore + Sync,
{
    let (batch_tx, batch_rx) = mpsc::channel(ctx.config.queue_capacity);
    let (ack_tx, ack_rx) = watch::channel(session.last_flushed());
    let mut made_progress = false;

    let reader = ReadLoop {
        router: &ctx.router,
        sequence: &mut ctx.sequence,
        tracker,
        read_timeout: ctx.config.read_timeout(),
        stop_when_idle: ctx.config.stop_when_idle(),
        made_progress: &mut made_progress,
    }
    .run(&mut session, batch_tx, ack_rx, shutdown_rx);

    let emitter = EmitLoop {
        destination: &ctx.destination,
        checkpoints: &mut ctx.checkpoints,
        tracker,
        config: &ctx.config.checkpoint,
    }
    .run(batch_rx, ack_tx);

    let (read_result, emit_result) = tokio::join!(reader, emitter);

    // A failed write also stops the reader, report the write failure.
    let result = match (read_result, emit_result) {
        (_, Err(err)) => Err(err),
        (read_result, Ok(())) => read_result,
    };

    SessionOutcome {
        session,
        result,
        made_progress,
    }
}

struct ReadLoop<'a> {
    router: &'a Router,
    sequence: &'a mut u64,
    tracker: &'a Mutex<PositionTracker>,
    read_timeout: Duration,
    stop_when_idle: Option<Duration>,
    made_progress: &'a mut bool,
}

impl ReadLoop<'_> {
    async fn run<S: SlotSession>(
        mut self,
        session: &mut SessionState<S>,
        batch_tx: mpsc::Sender<Batch>,
        mut ack_rx: watch::Receiver<PgLsn>,
        mut shutdown_rx: ShutdownRx,
    ) -> CdcResult<SessionExit> {
        let mut last_data = Instant::now();

        loop {
            if ack_rx.has_changed().unwrap_or(false) {
                let position = *ack_rx.borrow_and_update();
                session.acknowledge(position).await?;
                self.tracker.lock().await.flushed(position);

                debug!(slot_name = session.slot_name(), %position, "position acknowledged");
            }

            let read = tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    info!("shutdown requested, stopping the replication session");

                    return Ok(SessionExit::Shutdown);
                }
                _ = batch_tx.closed() => {
                    bail!(
                        ErrorKind::InvalidState,
                        "Event writer stopped",
                        "The destination writer stopped while the session was reading"
                    );
                }
                read = session.read(self.read_timeout) => read?,
            };

            match read {
                WireRead::Chunk { position, data } => {
                    last_data = Instant::now();
                    *self.made_progress = true;

                    let events = decode_payload(position, &data, &mut *self.sequence)?;
                    let mut routed = Vec::with_capacity(events.len());
                    for event in &events {
                        if let RouteResult::Routed(event) = self.router.route(event)? {
                            routed.push(event);
                        }
                    }

                    // The payload was read, it is handed over even if shutdown arrives meanwhile.
                    if batch_tx
                        .send(Batch {
                            position,
                            events: routed,
                        })
                        .await
                        .is_err()
                    {
                        bail!(
                            ErrorKind::InvalidState,
                            "Event writer stopped",
                            "The destination writer stopped while the session was reading"
                        );
                    }
                }
                WireRead::Idle { server_position } => {
                    debug!(?server_position, "no wire data");

                    if let Some(limit) = self.stop_when_idle
                        && last_data.elapsed() >= limit
                    {
                        info!(
                            idle_ms = limit.as_millis() as u64,
                            "no wire data within the idle limit, stopping"
                        );

                        return Ok(SessionExit::IdleStop);
                    }
                }
                WireRead::Closed => {
                    info!("replication stream closed by the server");

                    return Ok(SessionExit::Closed);
                }
            }
        }
    }
}

struct EmitLoop<'a, D, St> {
    destination: &'a D,
    checkpoints: &'a mut CheckpointWriter<St>,
    tracker: &'a Mutex<PositionTracker>,
    config: &'a CheckpointConfig,
}

impl<D, St> EmitLoop<'_, D, St>
where
    D: Destination,
    St: StateStore,
{
    async fn run(
        mut self,
        mut batch_rx: mpsc::Receiver<Batch>,
        ack_tx: watch::Sender<PgLsn>,
    ) -> CdcResult<()> {
        let mut timer = DeferredTimer::new(self.config.max_interval());
        let mut pending_events = 0usize;

        loop {
            let checkpoint_due = tokio::select! {
                biased;

                batch = batch_rx.recv() => {
                    let Some(batch) = batch else {
                        return Ok(());
                    };

                    if !batch.events.is_empty() {
                        pending_events += batch.events.len();
                        self.destination.write_events(batch.events).await?;
                    }
                    self.tracker.lock().await.advance(batch.position);
                    timer.start_if_inactive();

                    // A backlog keeps this branch ready, the interval is checked here too.
                    pending_events >= self.config.max_events || timer.is_elapsed()
                }
                _ = &mut timer => true,
            };

            if checkpoint_due {
                if let Some(position) = self.checkpoints.write(self.tracker).await? {
                    ack_tx.send_replace(position);
                }
                pending_events = 0;
                timer.stop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::state::memory::MemoryStore;
    use crate::types::{ColumnValue, Operation, TableName, Value};

    /// Destination taking a fixed time per write.
    struct SlowDestination {
        delay: Duration,
    }

    impl Destination for SlowDestination {
        fn name() -> &'static str {
            "slow"
        }

        async fn write_events(&self, _events: Vec<RoutedEvent>) -> CdcResult<()> {
            tokio::time::sleep(self.delay).await;
            Ok(())
        }
    }

    fn batch(position: u64) -> Batch {
        let event = RoutedEvent {
            stream_name: "public-users".to_string(),
            table: TableName::new("public", "users"),
            operation: Operation::Insert,
            record: vec![ColumnValue::new("id", Value::Integer(position as i64))],
            key: vec![Value::Integer(position as i64)],
            position: PgLsn::from(position),
            sequence: position,
        };

        Batch {
            position: PgLsn::from(position),
            events: vec![event],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn interval_checkpoint_is_taken_while_batches_are_backlogged() {
        let store = MemoryStore::new();
        let mut checkpoints = CheckpointWriter::new(store.clone(), "slot", BTreeSet::new(), None);
        let tracker = Mutex::new(PositionTracker::new(PgLsn::from(0)));
        let config = CheckpointConfig {
            max_events: 1000,
            max_interval_ms: 50,
        };
        let destination = SlowDestination {
            delay: Duration::from_millis(30),
        };

        // Every batch is queued up front, so a batch is always ready while writing.
        let (batch_tx, batch_rx) = mpsc::channel(8);
        for position in [10, 20, 30, 40] {
            batch_tx.send(batch(position)).await.unwrap();
        }
        drop(batch_tx);
        let (ack_tx, ack_rx) = watch::channel(PgLsn::from(0));

        EmitLoop {
            destination: &destination,
            checkpoints: &mut checkpoints,
            tracker: &tracker,
            config: &config,
        }
        .run(batch_rx, ack_tx)
        .await
        .unwrap();

        // The timer is armed after the first write at 30ms and due at 80ms, the third write
        // ends at 90ms.
        let stored = store.checkpoints("slot").await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].position, PgLsn::from(30));
        assert_eq!(*ack_rx.borrow(), PgLsn::from(30));
        assert_eq!(tracker.lock().await.confirmed(), PgLsn::from(40));
    }
}
