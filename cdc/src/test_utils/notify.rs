use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// How long tests wait for an awaited condition before failing.
pub const NOTIFY_DEADLINE: Duration = Duration::from_secs(30);

/// Notification handed out by test wrappers. Waiting on it fails the test at the deadline
/// instead of hanging it.
#[derive(Debug, Clone)]
pub struct TimedNotify(Arc<Notify>);

impl TimedNotify {
    pub fn new(notify: Arc<Notify>) -> Self {
        Self(notify)
    }

    /// Waits for the notification.
    ///
    /// # Panics
    ///
    /// Panics after [`NOTIFY_DEADLINE`].
    pub async fn notified(&self) {
        if tokio::time::timeout(NOTIFY_DEADLINE, self.0.notified())
            .await
            .is_err()
        {
            panic!("condition not reached within {NOTIFY_DEADLINE:?}");
        }
    }
}
