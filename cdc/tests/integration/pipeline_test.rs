use std::collections::BTreeSet;
use std::time::Duration;

use cdc::destination::memory::MemoryDestination;
use cdc::error::ErrorKind;
use cdc::pipeline::FlowState;
use cdc::store::state::memory::MemoryStore;
use cdc::store::state::{Checkpoint, StateStore};
use cdc::test_utils::catalog::{disabled, orders_entry, users_entry};
use cdc::test_utils::payload::{delete_user, insert, insert_user, update_user};
use cdc::test_utils::pipeline::PipelineBuilder;
use cdc::test_utils::slot::FakeSlotSource;
use cdc::test_utils::test_destination_wrapper::TestDestinationWrapper;
use cdc::types::{DELETED_AT_COLUMN, LSN_COLUMN, Operation, PgLsn, TableName, Value};
use cdc_config::shared::CdcConfig;
use cdc_telemetry::tracing::init_test_tracing;
use serde_json::json;

const SLOT_NAME: &str = CdcConfig::DEFAULT_SLOT_NAME;

fn streams(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|name| name.to_string()).collect()
}

#[tokio::test]
async fn events_are_delivered_in_order_and_checkpointed_on_shutdown() {
    init_test_tracing();

    let source = FakeSlotSource::new().with_consistent_point(100);
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

    let events_notify = destination.wait_for_events_count(3).await;
    source.push(110, insert_user(1, "alice"));
    source.push(120, insert_user(2, "bob"));
    source.push(130, update_user(1, "carol"));
    events_notify.notified().await;

    pipeline.shutdown_and_wait().await.unwrap();

    assert_eq!(destination.get_positions().await, vec![110, 120, 130]);
    let events = destination.get_events().await;
    assert_eq!(
        events.iter().map(|event| event.operation).collect::<Vec<_>>(),
        vec![Operation::Insert, Operation::Insert, Operation::Update]
    );
    assert!(events.windows(2).all(|pair| pair[0].sequence < pair[1].sequence));

    let checkpoints = store.checkpoints(SLOT_NAME).await;
    let last = checkpoints.last().unwrap();
    assert_eq!(last.position, PgLsn::from(130));
    assert_eq!(last.streams, streams(&["public-users"]));

    assert_eq!(source.confirmed_flush(), Some(PgLsn::from(130)));
    assert!(!source.is_active());
    assert!(destination.shutdown_called().await);

    let row = destination
        .wrapped_destination()
        .await
        .row("public-users", &[Value::Integer(1)])
        .await
        .unwrap();
    assert_eq!(row.record[1].value, Value::Text("carol".to_string()));
}

#[tokio::test]
async fn deletes_carry_keys_and_the_deletion_time() {
    init_test_tracing();

    let source = FakeSlotSource::new().with_consistent_point(100);
    let destination = TestDestinationWrapper::wrap(MemoryDestination::new());

    let mut pipeline = PipelineBuilder::new(
        vec![users_entry()],
        source.clone(),
        MemoryStore::new(),
        destination.clone(),
    )
    .build();
    pipeline.start().await.unwrap();

    let events_notify = destination.wait_for_events_count(2).await;
    source.push(110, insert_user(1, "alice"));
    source.push(120, delete_user(1));
    events_notify.notified().await;

    pipeline.shutdown_and_wait().await.unwrap();

    let events = destination.get_events().await;
    let (insert, delete) = (&events[0], &events[1]);

    assert_eq!(insert.value(DELETED_AT_COLUMN), Some(&Value::Null));
    assert_eq!(insert.value(LSN_COLUMN), Some(&Value::Integer(110)));

    assert_eq!(delete.operation, Operation::Delete);
    assert_eq!(delete.key, vec![Value::Integer(1)]);
    assert_eq!(delete.value("id"), Some(&Value::Integer(1)));
    assert_eq!(delete.value("name"), Some(&Value::Null));
    assert_eq!(
        delete.value(DELETED_AT_COLUMN),
        Some(&Value::Timestamp("2024-03-01T12:30:45Z".to_string()))
    );
    assert_eq!(delete.value(LSN_COLUMN), Some(&Value::Integer(120)));

    let row = destination
        .wrapped_destination()
        .await
        .row("public-users", &[Value::Integer(1)])
        .await
        .unwrap();
    assert!(row.deleted);
}

#[tokio::test]
async fn changes_of_unselected_tables_are_dropped_but_advance_the_position() {
    init_test_tracing();

    let source = FakeSlotSource::new().with_consistent_point(100);
    let store = MemoryStore::new();
    let destination = TestDestinationWrapper::wrap(MemoryDestination::new());

    let mut pipeline = PipelineBuilder::new(
        vec![users_entry(), disabled(orders_entry())],
        source.clone(),
        store.clone(),
        destination.clone(),
    )
    .build();
    pipeline.start().await.unwrap();

    let events_notify = destination.wait_for_events_count(1).await;
    source.push(
        110,
        insert(
            "public",
            "orders",
            &[("id", "integer", json!(1)), ("amount", "numeric", json!(9.5))],
        ),
    );
    source.push(120, insert_user(1, "alice"));
    source.push(
        130,
        insert(
            "public",
            "orders",
            &[("id", "integer", json!(2)), ("amount", "numeric", json!(3))],
        ),
    );
    events_notify.notified().await;

    pipeline.shutdown_and_wait().await.unwrap();

    let events = destination.get_events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].stream_name, "public-users");
    assert_eq!(
        source.requested_tables(),
        vec![vec![TableName::new("public", "users")]]
    );

    // The drain persists whatever was read before shutdown, at least the routed event.
    let checkpoint = store.load_checkpoint(SLOT_NAME).await.unwrap().unwrap();
    assert!(checkpoint.position >= PgLsn::from(120));
    assert_eq!(checkpoint.streams, streams(&["public-users"]));
}

#[tokio::test]
async fn restart_resumes_after_the_persisted_checkpoint() {
    init_test_tracing();

    let source = FakeSlotSource::new().with_existing_slot(100);
    source.push(110, insert_user(1, "alice"));
    source.push(120, insert_user(2, "bob"));
    source.push(130, insert_user(3, "carol"));

    let store = MemoryStore::new();
    store
        .store_checkpoint(
            SLOT_NAME,
            Checkpoint::new(PgLsn::from(120), streams(&["public-users"])),
        )
        .await
        .unwrap();
    let destination = TestDestinationWrapper::wrap(MemoryDestination::new());

    let mut pipeline = PipelineBuilder::new(
        vec![users_entry()],
        source.clone(),
        store.clone(),
        destination.clone(),
    )
    .build();
    pipeline.start().await.unwrap();

    destination.wait_for_events_count(1).await.notified().await;
    pipeline.shutdown_and_wait().await.unwrap();

    assert_eq!(destination.get_positions().await, vec![130]);
    assert_eq!(source.opened_at(), vec![PgLsn::from(120)]);
    assert_eq!(source.confirmed_flush(), Some(PgLsn::from(130)));
}

#[tokio::test]
async fn idle_stream_stops_the_pipeline() {
    init_test_tracing();

    let source = FakeSlotSource::new().with_consistent_point(100);
    source.push(110, insert_user(1, "alice"));
    let store = MemoryStore::new();
    let destination = TestDestinationWrapper::wrap(MemoryDestination::new());

    let mut pipeline = PipelineBuilder::new(
        vec![users_entry()],
        source.clone(),
        store.clone(),
        destination.clone(),
    )
    .with_stop_when_idle(100)
    .build();
    let state_rx = pipeline.subscribe_state();
    pipeline.start().await.unwrap();

    tokio::time::timeout(Duration::from_secs(10), pipeline.wait())
        .await
        .expect("pipeline did not stop while idle")
        .unwrap();

    assert_eq!(*state_rx.borrow(), FlowState::Closed);
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
    assert!(destination.shutdown_called().await);
}

#[tokio::test]
async fn shutdown_moves_through_draining_to_closed() {
    init_test_tracing();

    let source = FakeSlotSource::new().with_consistent_point(100);
    let destination = TestDestinationWrapper::wrap(MemoryDestination::new());

    let mut pipeline = PipelineBuilder::new(
        vec![users_entry()],
        source.clone(),
        MemoryStore::new(),
        destination.clone(),
    )
    .build();
    let mut state_rx = pipeline.subscribe_state();
    assert_eq!(pipeline.state(), FlowState::Idle);

    pipeline.start().await.unwrap();
    tokio::time::timeout(
        Duration::from_secs(5),
        state_rx.wait_for(|state| *state == FlowState::Streaming),
    )
    .await
    .expect("pipeline did not start streaming")
    .unwrap();

    pipeline.shutdown_and_wait().await.unwrap();

    assert_eq!(*state_rx.borrow(), FlowState::Closed);
    assert!(!source.is_active());
    assert!(destination.shutdown_called().await);
}

#[tokio::test]
async fn newly_enabled_stream_requires_resync() {
    init_test_tracing();

    let source = FakeSlotSource::new().with_existing_slot(100);
    let store = MemoryStore::new();
    store
        .store_checkpoint(
            SLOT_NAME,
            Checkpoint::new(PgLsn::from(100), streams(&["public-users"])),
        )
        .await
        .unwrap();

    let mut pipeline = PipelineBuilder::new(
        vec![users_entry(), orders_entry()],
        source.clone(),
        store.clone(),
        TestDestinationWrapper::wrap(MemoryDestination::new()),
    )
    .build();

    let err = pipeline.start().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResyncRequired);
    assert_eq!(err.last_confirmed(), Some(PgLsn::from(100)));
    assert_eq!(source.open_count(), 0);
}

#[tokio::test]
async fn newly_enabled_stream_is_captured_from_now_on_without_resync() {
    init_test_tracing();

    let source = FakeSlotSource::new().with_existing_slot(100);
    let store = MemoryStore::new();
    store
        .store_checkpoint(
            SLOT_NAME,
            Checkpoint::new(PgLsn::from(100), streams(&["public-users"])),
        )
        .await
        .unwrap();
    let destination = TestDestinationWrapper::wrap(MemoryDestination::new());

    let mut pipeline = PipelineBuilder::new(
        vec![users_entry(), orders_entry()],
        source.clone(),
        store.clone(),
        destination.clone(),
    )
    .with_resync_on_reselect(false)
    .build();
    pipeline.start().await.unwrap();

    let events_notify = destination.wait_for_events_count(1).await;
    source.push(
        110,
        insert(
            "public",
            "orders",
            &[("id", "integer", json!(1)), ("amount", "numeric", json!(9.5))],
        ),
    );
    events_notify.notified().await;

    pipeline.shutdown_and_wait().await.unwrap();

    let events = destination.get_events().await;
    assert_eq!(events[0].stream_name, "public-orders");
    assert_eq!(events[0].value("amount"), Some(&Value::Decimal("9.5".to_string())));

    // The selection change is recorded with the next checkpoint.
    let checkpoint = store.load_checkpoint(SLOT_NAME).await.unwrap().unwrap();
    assert_eq!(checkpoint.streams, streams(&["public-orders", "public-users"]));
}
