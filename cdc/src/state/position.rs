use tokio_postgres::types::PgLsn;
use tracing::debug;

/// Tracks the confirmed and flushed positions of one capture run.
///
/// Both positions only move forward and `flushed <= confirmed` holds at all times. Violations
/// are bugs in the caller and panic.
#[derive(Debug, Clone)]
pub struct PositionTracker {
    /// Highest position whose events were handed to the destination.
    confirmed: PgLsn,
    /// Highest position acknowledged to the server.
    flushed: PgLsn,
    /// Last position returned by [`PositionTracker::checkpoint`] and not flushed yet.
    candidate: Option<PgLsn>,
}

impl PositionTracker {
    /// Creates a tracker resuming from `position`, which is both confirmed and flushed.
    pub fn new(position: PgLsn) -> Self {
        Self {
            confirmed: position,
            flushed: position,
            candidate: None,
        }
    }

    /// Records that events up to `position` were delivered to the destination.
    ///
    /// A position below the confirmed one is ignored. That happens when the server replays a
    /// transaction that was partially delivered before a reconnect.
    pub fn advance(&mut self, position: PgLsn) {
        if position < self.confirmed {
            debug!(%position, confirmed = %self.confirmed, "ignoring replayed position");
            return;
        }

        self.confirmed = position;
    }

    /// Returns the confirmed position for persistence and makes it the next flush candidate.
    pub fn checkpoint(&mut self) -> PgLsn {
        self.candidate = Some(self.confirmed);
        self.confirmed
    }

    /// Records that `position` was acknowledged to the server.
    pub fn flushed(&mut self, position: PgLsn) {
        assert!(
            position <= self.confirmed,
            "flushed position {position} is ahead of confirmed position {}",
            self.confirmed
        );
        assert!(
            position >= self.flushed,
            "flushed position regressed from {} to {position}",
            self.flushed
        );

        self.flushed = position;
        if self.candidate.is_some_and(|candidate| candidate <= position) {
            self.candidate = None;
        }
    }

    pub fn confirmed(&self) -> PgLsn {
        self.confirmed
    }

    pub fn last_flushed(&self) -> PgLsn {
        self.flushed
    }

    /// Returns the checkpointed position still waiting to be acknowledged, if any.
    pub fn candidate(&self) -> Option<PgLsn> {
        self.candidate
    }

    /// Returns `true` if delivered events were not acknowledged yet.
    pub fn has_unflushed(&self) -> bool {
        self.confirmed > self.flushed
    }
}
