use std::future::Future;

use crate::error::CdcResult;
use crate::types::RoutedEvent;

/// Trait for systems that receive the routed change stream.
///
/// Delivery is at-least-once: after a restart or reconnect, events following the last
/// persisted checkpoint are written again. Implementations should make replays harmless, for
/// example by ignoring an event whose position is not newer than the one already stored for its
/// primary key.
pub trait Destination {
    /// Returns the name of the destination.
    fn name() -> &'static str;

    /// Propagates the shutdown of the pipeline to the destination.
    ///
    /// The default implementation is a no-op.
    fn shutdown(&self) -> impl Future<Output = CdcResult<()>> + Send {
        async { Ok(()) }
    }

    /// Writes a batch of routed events.
    ///
    /// Events are given in change log order. The batch counts as delivered once the returned
    /// future resolves successfully, and its positions may then be checkpointed.
    fn write_events(&self, events: Vec<RoutedEvent>) -> impl Future<Output = CdcResult<()>> + Send;
}
