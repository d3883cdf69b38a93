use std::fmt;
use std::sync::Arc;

use tokio::sync::{Notify, RwLock};

use crate::bail;
use crate::destination::Destination;
use crate::error::{CdcResult, ErrorKind};
use crate::test_utils::notify::TimedNotify;
use crate::types::{Operation, RoutedEvent};

type EventCondition = Box<dyn Fn(&[RoutedEvent]) -> bool + Send + Sync>;

struct Inner<D> {
    wrapped_destination: D,
    events: Vec<RoutedEvent>,
    event_conditions: Vec<(EventCondition, Arc<Notify>)>,
    write_events_called: u64,
    /// Remaining successful writes before every write fails, unlimited when `None`.
    remaining_writes: Option<u64>,
    shutdown_called: bool,
}

impl<D> Inner<D> {
    fn check_conditions(&mut self) {
        let events = &self.events;
        self.event_conditions.retain(|(condition, notify)| {
            let should_retain = !condition(events);
            if !should_retain {
                notify.notify_one();
            }
            should_retain
        });
    }
}

/// Test wrapper for [`Destination`] implementations that records every written event.
///
/// Tests register conditions on the recorded events and await the returned [`TimedNotify`],
/// which makes assertions on the asynchronous pipeline deterministic.
#[derive(Clone)]
pub struct TestDestinationWrapper<D> {
    inner: Arc<RwLock<Inner<D>>>,
}

impl<D> fmt::Debug for TestDestinationWrapper<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("TestDestinationWrapper");
        if let Ok(inner) = self.inner.try_read() {
            debug
                .field("events", &inner.events.len())
                .field("write_events_called", &inner.write_events_called)
                .field("shutdown_called", &inner.shutdown_called);
        }
        debug.finish_non_exhaustive()
    }
}

impl<D> TestDestinationWrapper<D> {
    pub fn wrap(destination: D) -> Self {
        let inner = Inner {
            wrapped_destination: destination,
            events: Vec::new(),
            event_conditions: Vec::new(),
            write_events_called: 0,
            remaining_writes: None,
            shutdown_called: false,
        };

        Self {
            inner: Arc::new(RwLock::new(inner)),
        }
    }

    /// Returns every event written so far, in write order.
    pub async fn get_events(&self) -> Vec<RoutedEvent> {
        self.inner.read().await.events.clone()
    }

    /// Returns the positions of the written events, in write order.
    pub async fn get_positions(&self) -> Vec<u64> {
        self.inner
            .read()
            .await
            .events
            .iter()
            .map(|event| u64::from(event.position))
            .collect()
    }

    /// Registers a notification that fires once the written events satisfy `condition`.
    pub async fn notify_on_events<F>(&self, condition: F) -> TimedNotify
    where
        F: Fn(&[RoutedEvent]) -> bool + Send + Sync + 'static,
    {
        let notify = Arc::new(Notify::new());
        let mut inner = self.inner.write().await;
        inner
            .event_conditions
            .push((Box::new(condition), notify.clone()));

        // Conditions may already hold.
        inner.check_conditions();

        TimedNotify::new(notify)
    }

    /// Registers a notification that fires once at least `count` events were written.
    pub async fn wait_for_events_count(&self, count: usize) -> TimedNotify {
        self.notify_on_events(move |events| events.len() >= count)
            .await
    }

    /// Registers a notification that fires once at least `count` events of `operation` were
    /// written.
    pub async fn wait_for_operation_count(
        &self,
        operation: Operation,
        count: usize,
    ) -> TimedNotify {
        self.notify_on_events(move |events| {
            events
                .iter()
                .filter(|event| event.operation == operation)
                .count()
                >= count
        })
        .await
    }

    /// Lets `count` more writes succeed, then fails every further write.
    pub async fn fail_writes_after(&self, count: u64) {
        self.inner.write().await.remaining_writes = Some(count);
    }

    pub async fn write_events_called(&self) -> u64 {
        self.inner.read().await.write_events_called
    }

    pub async fn shutdown_called(&self) -> bool {
        self.inner.read().await.shutdown_called
    }

    /// Returns a clone of the wrapped destination.
    pub async fn wrapped_destination(&self) -> D
    where
        D: Clone,
    {
        self.inner.read().await.wrapped_destination.clone()
    }
}

impl<D> Destination for TestDestinationWrapper<D>
where
    D: Destination + Send + Sync,
{
    fn name() -> &'static str {
        D::name()
    }

    async fn shutdown(&self) -> CdcResult<()> {
        let mut inner = self.inner.write().await;
        inner.shutdown_called = true;

        inner.wrapped_destination.shutdown().await
    }

    async fn write_events(&self, events: Vec<RoutedEvent>) -> CdcResult<()> {
        let mut inner = self.inner.write().await;
        inner.write_events_called += 1;

        match inner.remaining_writes.as_mut() {
            Some(0) => bail!(
                ErrorKind::DestinationIoError,
                "Injected destination failure",
                format!("Writing {} events failed", events.len())
            ),
            Some(count) => *count -= 1,
            None => {}
        }

        inner
            .wrapped_destination
            .write_events(events.clone())
            .await?;
        inner.events.extend(events);
        inner.check_conditions();

        Ok(())
    }
}
