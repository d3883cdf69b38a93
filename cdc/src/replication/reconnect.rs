//! Reconnection bookkeeping for the replication session.
//!
//! Counts consecutive session failures and computes the exponential backoff waited before the
//! slot is reopened. The retry loop itself lives in the flow controller, which owns the flow
//! state.

use std::time::Duration;

use cdc_config::shared::ReconnectionConfig;
use rand::Rng;
use tokio::time::Instant;
use tokio_postgres::types::PgLsn;

use crate::error::{CdcError, ErrorKind};

/// Upper bound of the random jitter, as a fraction of the delay.
const MAX_JITTER: f64 = 0.3;

/// Where the reconnection state machine currently is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectionStatus {
    /// A session is open and streaming.
    Connected,
    /// Waiting to reopen the slot.
    Reconnecting {
        /// 1-based number of the failure being retried.
        attempt: u32,
    },
    /// Gave up, either out of budget or on a failure that is not retried.
    Failed { reason: String },
}

/// Returns the delay before reopening after the `attempt`th consecutive failure.
///
/// `initial * multiplier^(attempt - 1)` capped at the maximum delay, then stretched by
/// `jitter`, a fraction in `[0, 0.3)`.
pub fn backoff_delay(config: &ReconnectionConfig, attempt: u32, jitter: f64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let delay_ms = (config.initial_retry_delay_ms as f64 * config.backoff_multiplier.powi(exponent))
        .min(config.max_retry_delay_ms as f64);

    Duration::from_millis((delay_ms * (1.0 + jitter.clamp(0.0, MAX_JITTER))) as u64)
}

/// Decides whether and when the slot is reopened after a failure.
#[derive(Debug)]
pub struct ReconnectionManager {
    config: ReconnectionConfig,
    status: ReconnectionStatus,
    attempts: u32,
    first_failure: Option<Instant>,
    last_error: Option<CdcError>,
    resume_position: Option<PgLsn>,
}

impl ReconnectionManager {
    pub fn new(config: ReconnectionConfig) -> Self {
        Self {
            config,
            status: ReconnectionStatus::Connected,
            attempts: 0,
            first_failure: None,
            last_error: None,
            resume_position: None,
        }
    }

    pub fn config(&self) -> &ReconnectionConfig {
        &self.config
    }

    pub fn status(&self) -> &ReconnectionStatus {
        &self.status
    }

    /// Number of consecutive failures in the current sequence.
    pub fn attempt_count(&self) -> u32 {
        self.attempts
    }

    pub fn last_error(&self) -> Option<&CdcError> {
        self.last_error.as_ref()
    }

    /// Position the next session resumes from, once a session was lost.
    pub fn resume_position(&self) -> Option<PgLsn> {
        self.resume_position
    }

    pub fn set_resume_position(&mut self, position: PgLsn) {
        self.resume_position = Some(position);
    }

    /// Returns `true` when the slot should be reopened after `error`.
    ///
    /// Requires reconnection to be enabled, a retryable error and remaining budget.
    pub fn should_retry(&self, error: &CdcError) -> bool {
        self.config.enabled && self.is_retryable(error) && !self.is_exhausted()
    }

    /// Returns `true` when `error` is of a kind that reopening the slot may resolve.
    ///
    /// A busy slot only counts while reconnecting: the server may still hold the walsender of
    /// the lost session for a moment.
    pub fn is_retryable(&self, error: &CdcError) -> bool {
        let kind = error.kind();

        kind.is_connection_retryable()
            || (kind == ErrorKind::SlotBusy
                && matches!(self.status, ReconnectionStatus::Reconnecting { .. }))
    }

    /// Checks whether the attempt cap or the time budget is used up.
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.config.max_attempts
            || self
                .total_retry_duration()
                .is_some_and(|elapsed| elapsed >= self.config.max_retry_duration())
    }

    /// Returns the delay before the next reopen, jittered.
    pub fn calculate_backoff(&self) -> Duration {
        let jitter = rand::rng().random::<f64>() * MAX_JITTER;
        backoff_delay(&self.config, self.attempts, jitter)
    }

    /// Records a failure and moves to [`ReconnectionStatus::Reconnecting`].
    pub fn record_failure(&mut self, error: CdcError) {
        self.first_failure.get_or_insert_with(Instant::now);
        self.attempts += 1;
        self.last_error = Some(error);
        self.status = ReconnectionStatus::Reconnecting {
            attempt: self.attempts,
        };
    }

    /// Ends the failure sequence after a session made progress.
    pub fn record_success(&mut self) {
        self.status = ReconnectionStatus::Connected;
        self.attempts = 0;
        self.first_failure = None;
        self.last_error = None;
    }

    pub fn mark_failed(&mut self, reason: String) {
        self.status = ReconnectionStatus::Failed { reason };
    }

    /// Time since the first failure of the current sequence.
    pub fn total_retry_duration(&self) -> Option<Duration> {
        self.first_failure.map(|first| first.elapsed())
    }
}
