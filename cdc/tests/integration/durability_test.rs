use cdc::destination::memory::MemoryDestination;
use cdc::error::ErrorKind;
use cdc::store::state::StateStore;
use cdc::test_utils::catalog::users_entry;
use cdc::test_utils::payload::insert_user;
use cdc::test_utils::pipeline::PipelineBuilder;
use cdc::test_utils::slot::FakeSlotSource;
use cdc::test_utils::store::{Journal, JournalingStore};
use cdc::test_utils::test_destination_wrapper::TestDestinationWrapper;
use cdc::types::{PgLsn, Value};
use cdc_config::shared::{CdcConfig, CheckpointConfig};
use cdc_telemetry::tracing::init_test_tracing;

const SLOT_NAME: &str = CdcConfig::DEFAULT_SLOT_NAME;

/// Checkpoints only by event count, every two events.
fn every_two_events() -> CheckpointConfig {
    CheckpointConfig {
        max_events: 2,
        max_interval_ms: 60_000,
    }
}

#[tokio::test]
async fn positions_are_persisted_before_they_are_acknowledged() {
    init_test_tracing();

    let journal = Journal::new();
    let source = FakeSlotSource::new()
        .with_consistent_point(100)
        .with_journal(journal.clone());
    let store = JournalingStore::new(journal.clone());
    let destination = TestDestinationWrapper::wrap(MemoryDestination::new());

    let mut pipeline = PipelineBuilder::new(
        vec![users_entry()],
        source.clone(),
        store,
        destination.clone(),
    )
    .with_checkpoint_config(every_two_events())
    .build();
    pipeline.start().await.unwrap();

    let events_notify = destination.wait_for_events_count(5).await;
    for (index, position) in [110, 120, 130, 140, 150].into_iter().enumerate() {
        source.push(position, insert_user(index as i64, "user"));
    }
    events_notify.notified().await;

    pipeline.shutdown_and_wait().await.unwrap();

    assert_eq!(journal.first_unpersisted_acknowledgement(), None);
    assert_eq!(journal.persisted().last(), Some(&PgLsn::from(150)));
    assert_eq!(journal.acknowledged().last(), Some(&PgLsn::from(150)));
    assert!(
        journal
            .acknowledged()
            .windows(2)
            .all(|pair| pair[0] < pair[1])
    );
}

#[tokio::test]
async fn events_after_the_last_checkpoint_are_redelivered_after_a_failure() {
    init_test_tracing();

    let source = FakeSlotSource::new().with_consistent_point(100);
    for (index, position) in [110, 120, 130, 140].into_iter().enumerate() {
        source.push(position, insert_user(index as i64 + 1, "user"));
    }

    let journal = Journal::new();
    let store = JournalingStore::new(journal.clone());
    store.fail_stores_after(1);
    let memory = MemoryDestination::new();
    let first_destination = TestDestinationWrapper::wrap(memory.clone());

    let mut pipeline = PipelineBuilder::new(
        vec![users_entry()],
        source.clone(),
        store.clone(),
        first_destination.clone(),
    )
    .with_checkpoint_config(every_two_events())
    .build();
    pipeline.start().await.unwrap();

    let err = pipeline.wait().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StateStoreIoError);
    assert_eq!(err.last_confirmed(), Some(PgLsn::from(140)));
    assert_eq!(first_destination.get_positions().await, vec![110, 120, 130, 140]);
    assert_eq!(journal.persisted(), vec![PgLsn::from(120)]);

    // The next run resumes from the durable checkpoint and delivers the tail again.
    let store = JournalingStore::wrap(store.memory_store().clone(), journal.clone());
    let second_destination = TestDestinationWrapper::wrap(memory.clone());
    let mut pipeline = PipelineBuilder::new(
        vec![users_entry()],
        source.clone(),
        store.clone(),
        second_destination.clone(),
    )
    .with_checkpoint_config(every_two_events())
    .build();
    pipeline.start().await.unwrap();

    second_destination
        .wait_for_events_count(2)
        .await
        .notified()
        .await;
    pipeline.shutdown_and_wait().await.unwrap();

    assert_eq!(second_destination.get_positions().await, vec![130, 140]);
    assert_eq!(source.opened_at().last(), Some(&PgLsn::from(120)));
    assert_eq!(
        store
            .load_checkpoint(SLOT_NAME)
            .await
            .unwrap()
            .map(|checkpoint| checkpoint.position),
        Some(PgLsn::from(140))
    );

    // Replays leave the materialized rows as if every event was written once.
    assert_eq!(memory.events().await.len(), 6);
    assert_eq!(memory.rows_count().await, 4);
    let row = memory
        .row("public-users", &[Value::Integer(3)])
        .await
        .unwrap();
    assert_eq!(row.position, PgLsn::from(130));
}
