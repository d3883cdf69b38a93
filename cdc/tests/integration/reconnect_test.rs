use std::collections::BTreeSet;
use std::time::Duration;

use bytes::Bytes;
use cdc::destination::memory::MemoryDestination;
use cdc::error::{CdcError, ErrorKind};
use cdc::pipeline::FlowState;
use cdc::replication::session::SlotSource;
use cdc::store::state::memory::MemoryStore;
use cdc::store::state::{Checkpoint, StateStore};
use cdc::test_utils::catalog::users_entry;
use cdc::test_utils::payload::insert_user;
use cdc::test_utils::pipeline::PipelineBuilder;
use cdc::test_utils::slot::FakeSlotSource;
use cdc::test_utils::store::{Journal, JournalingStore};
use cdc::test_utils::test_destination_wrapper::TestDestinationWrapper;
use cdc::types::{PgLsn, TableName};
use cdc_config::shared::CdcConfig;
use cdc_telemetry::tracing::init_test_tracing;

const SLOT_NAME: &str = CdcConfig::DEFAULT_SLOT_NAME;

fn connection_lost() -> CdcError {
    CdcError::from((ErrorKind::SourceConnectionFailed, "connection refused"))
}

async fn users_checkpoint(store: &MemoryStore, position: u64) {
    store
        .store_checkpoint(
            SLOT_NAME,
            Checkpoint::new(
                PgLsn::from(position),
                BTreeSet::from(["public-users".to_string()]),
            ),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn lost_connection_resumes_without_replay_or_gaps() {
    init_test_tracing();

    let journal = Journal::new();
    let source = FakeSlotSource::new()
        .with_consistent_point(90)
        .with_journal(journal.clone());
    source.disconnect_after(2);

    let store = JournalingStore::new(journal.clone());
    let destination = TestDestinationWrapper::wrap(MemoryDestination::new());

    let mut pipeline = PipelineBuilder::new(
        vec![users_entry()],
        source.clone(),
        store.clone(),
        destination.clone(),
    )
    .build();
    let mut state_rx = pipeline.subscribe_state();
    pipeline.start().await.unwrap();

    tokio::time::timeout(
        Duration::from_secs(5),
        state_rx.wait_for(|state| *state == FlowState::Streaming),
    )
    .await
    .expect("pipeline did not start streaming")
    .unwrap();

    // The server may still hold the dropped walsender when the slot is reopened.
    source.fail_next_open(CdcError::from((ErrorKind::SlotBusy, "slot is active")));
    let events_notify = destination.wait_for_events_count(3).await;
    source.push(100, insert_user(1, "alice"));
    source.push(110, insert_user(2, "bob"));
    source.push(120, insert_user(3, "carol"));
    events_notify.notified().await;
    pipeline.shutdown_and_wait().await.unwrap();

    assert_eq!(destination.get_positions().await, vec![100, 110, 120]);
    assert_eq!(
        source.opened_at(),
        vec![PgLsn::from(90), PgLsn::from(110)]
    );
    assert_eq!(source.open_count(), 3);

    let acknowledged = source.acknowledged();
    assert!(acknowledged.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(source.confirmed_flush(), Some(PgLsn::from(120)));
    assert_eq!(journal.first_unpersisted_acknowledgement(), None);
}

#[tokio::test]
async fn exhausted_reconnection_surfaces_the_last_confirmed_position() {
    init_test_tracing();

    let source = FakeSlotSource::new().with_existing_slot(100);
    for _ in 0..6 {
        source.fail_next_open(connection_lost());
    }
    let store = MemoryStore::new();
    users_checkpoint(&store, 100).await;
    let destination = TestDestinationWrapper::wrap(MemoryDestination::new());

    let mut pipeline = PipelineBuilder::new(
        vec![users_entry()],
        source.clone(),
        store,
        destination.clone(),
    )
    .build();
    let state_rx = pipeline.subscribe_state();
    pipeline.start().await.unwrap();

    let err = pipeline.wait().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReconnectionExhausted);
    assert_eq!(err.last_confirmed(), Some(PgLsn::from(100)));
    assert_eq!(source.open_count(), 6);
    assert_eq!(*state_rx.borrow(), FlowState::Closed);
    assert!(destination.shutdown_called().await);
}

#[tokio::test]
async fn malformed_payload_is_fatal_and_keeps_delivered_events() {
    init_test_tracing();

    let source = FakeSlotSource::new().with_consistent_point(100);
    source.push(110, insert_user(1, "alice"));
    source.push(120, Bytes::from_static(b"{\"action\": \"I\", \"columns\": ["));
    source.push(130, insert_user(2, "bob"));
    let store = MemoryStore::new();
    let destination = TestDestinationWrapper::wrap(MemoryDestination::new());

    let mut pipeline = PipelineBuilder::new(
        vec![users_entry()],
        source.clone(),
        store.clone(),
        destination.clone(),
    )
    .build();
    pipeline.start().await.unwrap();

    let err = pipeline.wait().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedPayload);
    assert_eq!(err.last_confirmed(), Some(PgLsn::from(110)));

    assert_eq!(destination.get_positions().await, vec![110]);
    assert_eq!(
        store
            .load_checkpoint(SLOT_NAME)
            .await
            .unwrap()
            .map(|checkpoint| checkpoint.position),
        Some(PgLsn::from(110))
    );
    assert_eq!(source.confirmed_flush(), Some(PgLsn::from(110)));
    assert_eq!(source.open_count(), 1);
}

#[tokio::test]
async fn slot_used_by_another_session_is_fatal() {
    init_test_tracing();

    let source = FakeSlotSource::new().with_existing_slot(100);
    let other = source
        .open(SLOT_NAME, None, &[TableName::new("public", "users")])
        .await
        .unwrap();

    let mut pipeline = PipelineBuilder::new(
        vec![users_entry()],
        source.clone(),
        MemoryStore::new(),
        TestDestinationWrapper::wrap(MemoryDestination::new()),
    )
    .build();
    pipeline.start().await.unwrap();

    let err = pipeline.wait().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SlotBusy);
    assert_eq!(source.open_count(), 2);
    drop(other);
}

#[tokio::test]
async fn released_resume_position_is_fatal() {
    init_test_tracing();

    let source = FakeSlotSource::new().with_existing_slot(150);
    let store = MemoryStore::new();
    users_checkpoint(&store, 120).await;

    let mut pipeline = PipelineBuilder::new(
        vec![users_entry()],
        source.clone(),
        store,
        TestDestinationWrapper::wrap(MemoryDestination::new()),
    )
    .build();
    pipeline.start().await.unwrap();

    let err = pipeline.wait().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PositionUnavailable);
    assert_eq!(err.last_confirmed(), Some(PgLsn::from(120)));
    assert_eq!(source.confirmed_flush(), Some(PgLsn::from(150)));
}
