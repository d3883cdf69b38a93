//! An in-memory replication slot.
//!
//! The slot holds an ascending log of wal2json payloads. Sessions stream the payloads after
//! their start position and confirm positions the way the server does: acknowledgements and
//! the start position of a session both move the slot's confirmed position forward.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use cdc_postgres::replication::slots::WAL2JSON_PLUGIN;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_postgres::types::PgLsn;

use crate::bail;
use crate::error::{CdcError, CdcResult, ErrorKind};
use crate::replication::client::{SlotAction, SlotInfo, check_slot};
use crate::replication::session::{SlotSession, SlotSource, WireRead};
use crate::test_utils::store::{Journal, JournalEntry};
use crate::types::TableName;

#[derive(Debug)]
struct Slot {
    active: bool,
    confirmed_flush: PgLsn,
}

#[derive(Debug)]
struct Inner {
    slot: Option<Slot>,
    consistent_point: PgLsn,
    log: Vec<(PgLsn, Bytes)>,
    open_failures: VecDeque<CdcError>,
    /// Number of chunks each upcoming session delivers before losing its connection.
    disconnects: VecDeque<usize>,
    opened_at: Vec<PgLsn>,
    open_count: usize,
    requested_tables: Vec<Vec<TableName>>,
    acknowledged: Vec<PgLsn>,
    journal: Option<Journal>,
}

impl Inner {
    fn confirm(&mut self, position: PgLsn) {
        let Some(slot) = self.slot.as_mut() else {
            return;
        };
        if position <= slot.confirmed_flush {
            return;
        }

        slot.confirmed_flush = position;
        if let Some(journal) = &self.journal {
            journal.record(JournalEntry::Acknowledged(position));
        }
    }

    fn slot_info(&self) -> Option<SlotInfo> {
        self.slot.as_ref().map(|slot| SlotInfo {
            plugin: Some(WAL2JSON_PLUGIN.to_string()),
            slot_type: "logical".to_string(),
            active: slot.active,
            confirmed_flush_lsn: Some(slot.confirmed_flush),
        })
    }
}

/// A scripted replication slot implementing [`SlotSource`].
///
/// Clones share the same slot.
#[derive(Debug, Clone)]
pub struct FakeSlotSource {
    inner: Arc<Mutex<Inner>>,
    appended: Arc<Notify>,
}

impl FakeSlotSource {
    /// Creates a source whose slot does not exist yet. It is created on first open with its
    /// consistent point at `0/0`.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                slot: None,
                consistent_point: PgLsn::from(0),
                log: Vec::new(),
                open_failures: VecDeque::new(),
                disconnects: VecDeque::new(),
                opened_at: Vec::new(),
                open_count: 0,
                requested_tables: Vec::new(),
                acknowledged: Vec::new(),
                journal: None,
            })),
            appended: Arc::new(Notify::new()),
        }
    }

    /// Sets the position a created slot starts at.
    pub fn with_consistent_point(self, position: u64) -> Self {
        self.inner.lock().unwrap().consistent_point = PgLsn::from(position);
        self
    }

    /// Makes the slot exist with `confirmed` as its confirmed position.
    pub fn with_existing_slot(self, confirmed: u64) -> Self {
        self.inner.lock().unwrap().slot = Some(Slot {
            active: false,
            confirmed_flush: PgLsn::from(confirmed),
        });
        self
    }

    /// Records slot confirmations into `journal`.
    pub fn with_journal(self, journal: Journal) -> Self {
        self.inner.lock().unwrap().journal = Some(journal);
        self
    }

    /// Appends a payload at `position`, which must be beyond every appended position.
    pub fn push(&self, position: u64, data: Bytes) {
        let position = PgLsn::from(position);
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some((last, _)) = inner.log.last() {
                assert!(
                    position > *last,
                    "payload at {position} does not follow {last}"
                );
            }
            inner.log.push((position, data));
        }

        self.appended.notify_waiters();
    }

    /// Appends several payloads at once.
    pub fn push_all(&self, payloads: impl IntoIterator<Item = (u64, Bytes)>) {
        for (position, data) in payloads {
            self.push(position, data);
        }
    }

    /// Makes the next open fail with `err`.
    pub fn fail_next_open(&self, err: CdcError) {
        self.inner.lock().unwrap().open_failures.push_back(err);
    }

    /// Makes the next session lose its connection once it delivered `chunks` payloads.
    pub fn disconnect_after(&self, chunks: usize) {
        self.inner.lock().unwrap().disconnects.push_back(chunks);
    }

    /// Positions acknowledged by sessions, in order.
    pub fn acknowledged(&self) -> Vec<PgLsn> {
        self.inner.lock().unwrap().acknowledged.clone()
    }

    /// Start positions of the sessions opened so far.
    pub fn opened_at(&self) -> Vec<PgLsn> {
        self.inner.lock().unwrap().opened_at.clone()
    }

    /// Number of open attempts, failed ones included.
    pub fn open_count(&self) -> usize {
        self.inner.lock().unwrap().open_count
    }

    /// Table lists requested by the open attempts.
    pub fn requested_tables(&self) -> Vec<Vec<TableName>> {
        self.inner.lock().unwrap().requested_tables.clone()
    }

    pub fn confirmed_flush(&self) -> Option<PgLsn> {
        self.inner
            .lock()
            .unwrap()
            .slot
            .as_ref()
            .map(|slot| slot.confirmed_flush)
    }

    pub fn is_active(&self) -> bool {
        self.inner
            .lock()
            .unwrap()
            .slot
            .as_ref()
            .is_some_and(|slot| slot.active)
    }
}

impl Default for FakeSlotSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotSource for FakeSlotSource {
    type Session = FakeSlotSession;

    async fn open(
        &self,
        slot_name: &str,
        start: Option<PgLsn>,
        tables: &[TableName],
    ) -> CdcResult<FakeSlotSession> {
        let mut inner = self.inner.lock().unwrap();
        inner.open_count += 1;
        inner.requested_tables.push(tables.to_vec());

        if let Some(err) = inner.open_failures.pop_front() {
            return Err(err);
        }

        let start = match check_slot(slot_name, inner.slot_info().as_ref(), start)? {
            SlotAction::Create => {
                let consistent_point = inner.consistent_point;
                inner.slot = Some(Slot {
                    active: false,
                    confirmed_flush: consistent_point,
                });
                consistent_point
            }
            SlotAction::Attach { start } => start,
        };

        if let Some(slot) = inner.slot.as_mut() {
            slot.active = true;
        }
        inner.confirm(start);
        inner.opened_at.push(start);
        let disconnect_after = inner.disconnects.pop_front();

        Ok(FakeSlotSession {
            inner: self.inner.clone(),
            appended: self.appended.clone(),
            start,
            cursor: start,
            delivered: 0,
            disconnect_after,
        })
    }
}

/// A session of a [`FakeSlotSource`]. Dropping it frees the slot.
#[derive(Debug)]
pub struct FakeSlotSession {
    inner: Arc<Mutex<Inner>>,
    appended: Arc<Notify>,
    start: PgLsn,
    cursor: PgLsn,
    delivered: usize,
    disconnect_after: Option<usize>,
}

impl FakeSlotSession {
    fn next_chunk(&self) -> Option<(PgLsn, Bytes)> {
        let inner = self.inner.lock().unwrap();
        inner
            .log
            .iter()
            .find(|(position, _)| *position > self.cursor)
            .cloned()
    }
}

impl SlotSession for FakeSlotSession {
    fn start_position(&self) -> PgLsn {
        self.start
    }

    async fn read_next(&mut self, timeout: Duration) -> CdcResult<WireRead> {
        if self
            .disconnect_after
            .is_some_and(|limit| self.delivered >= limit)
        {
            bail!(
                ErrorKind::SourceConnectionFailed,
                "Replication connection lost",
                format!("Connection dropped after {} payloads", self.delivered)
            );
        }

        let deadline = Instant::now() + timeout;
        loop {
            let appended = self.appended.notified();
            tokio::pin!(appended);
            // Registers before the log is inspected so that no push is missed.
            appended.as_mut().enable();

            if let Some((position, data)) = self.next_chunk() {
                self.cursor = position;
                self.delivered += 1;

                return Ok(WireRead::Chunk { position, data });
            }

            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(WireRead::Idle {
                    server_position: None,
                });
            }
        }
    }

    async fn acknowledge(&mut self, position: PgLsn) -> CdcResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.acknowledged.push(position);
        inner.confirm(position);

        Ok(())
    }

    async fn close(self) -> CdcResult<()> {
        Ok(())
    }
}

impl Drop for FakeSlotSession {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.lock()
            && let Some(slot) = inner.slot.as_mut()
        {
            slot.active = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Vec<TableName> {
        vec![TableName::new("public", "users")]
    }

    #[tokio::test]
    async fn created_slot_streams_from_the_consistent_point() {
        let source = FakeSlotSource::new().with_consistent_point(100);
        source.push(90, Bytes::from_static(b"{}"));
        source.push(110, Bytes::from_static(b"{}"));

        let mut session = source.open("tappostgres", None, &table()).await.unwrap();
        assert_eq!(session.start_position(), PgLsn::from(100));

        let read = session.read_next(Duration::from_millis(10)).await.unwrap();
        assert!(matches!(read, WireRead::Chunk { position, .. } if position == PgLsn::from(110)));
        assert_eq!(
            session.read_next(Duration::from_millis(10)).await.unwrap(),
            WireRead::Idle {
                server_position: None
            }
        );
    }

    #[tokio::test]
    async fn second_session_on_active_slot_is_busy() {
        let source = FakeSlotSource::new().with_existing_slot(100);
        let session = source.open("tappostgres", None, &table()).await.unwrap();

        let err = source
            .open("tappostgres", None, &table())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SlotBusy);

        drop(session);
        assert!(!source.is_active());
        assert!(source.open("tappostgres", None, &table()).await.is_ok());
    }

    #[tokio::test]
    async fn opening_at_a_later_position_confirms_it() {
        let journal = Journal::new();
        let source = FakeSlotSource::new()
            .with_existing_slot(100)
            .with_journal(journal.clone());

        let session = source
            .open("tappostgres", Some(PgLsn::from(120)), &table())
            .await
            .unwrap();

        assert_eq!(session.start_position(), PgLsn::from(120));
        assert_eq!(source.confirmed_flush(), Some(PgLsn::from(120)));
        assert_eq!(journal.acknowledged(), vec![PgLsn::from(120)]);
    }

    #[tokio::test]
    async fn released_position_is_unavailable() {
        let source = FakeSlotSource::new().with_existing_slot(100);

        let err = source
            .open("tappostgres", Some(PgLsn::from(90)), &table())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PositionUnavailable);
    }

    #[tokio::test]
    async fn session_disconnects_after_the_scripted_count() {
        let source = FakeSlotSource::new();
        source.push(10, Bytes::from_static(b"{}"));
        source.push(20, Bytes::from_static(b"{}"));
        source.disconnect_after(1);

        let mut session = source.open("tappostgres", None, &table()).await.unwrap();
        session.read_next(Duration::from_millis(10)).await.unwrap();

        let err = session
            .read_next(Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SourceConnectionFailed);
    }

    #[tokio::test]
    async fn pushed_payload_wakes_a_waiting_read() {
        let source = FakeSlotSource::new();
        let mut session = source.open("tappostgres", None, &table()).await.unwrap();

        let pusher = source.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            pusher.push(10, Bytes::from_static(b"{}"));
        });

        let read = session.read_next(Duration::from_secs(5)).await.unwrap();
        assert!(matches!(read, WireRead::Chunk { position, .. } if position == PgLsn::from(10)));
    }
}
