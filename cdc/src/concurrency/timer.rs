//! A deadline that stays pending until armed.
//!
//! [`DeferredTimer`] is `Unpin` and can be awaited directly in `tokio::select!`. The flow
//! controller arms it when the first event after a checkpoint is delivered and disarms it when
//! the checkpoint is taken, so an idle stream does not wake up for nothing.

use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Duration;
use tokio::time::{Instant, Sleep, sleep};

/// A future that resolves once the configured duration elapsed after [`DeferredTimer::start`].
///
/// While inactive the timer is always pending.
#[derive(Debug)]
pub struct DeferredTimer {
    deadline: Option<Pin<Box<Sleep>>>,
    duration: Duration,
}

impl DeferredTimer {
    /// Creates an inactive timer for `duration`.
    pub fn new(duration: Duration) -> Self {
        Self {
            deadline: None,
            duration,
        }
    }

    /// Arms the timer, replacing any deadline armed before.
    pub fn start(&mut self) {
        self.deadline = Some(Box::pin(sleep(self.duration)));
    }

    /// Arms the timer unless it is already armed.
    pub fn start_if_inactive(&mut self) {
        if self.deadline.is_none() {
            self.start();
        }
    }

    /// Disarms the timer.
    pub fn stop(&mut self) {
        self.deadline = None;
    }

    /// Returns `true` if the timer is armed and its deadline has passed.
    ///
    /// Compares against the clock, so it holds even when the timer was never polled.
    pub fn is_elapsed(&self) -> bool {
        self.deadline
            .as_ref()
            .is_some_and(|armed| armed.deadline() <= Instant::now())
    }
}

impl Future for DeferredTimer {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        let Some(deadline) = this.deadline.as_mut() else {
            return Poll::Pending;
        };

        ready!(deadline.as_mut().poll(cx));
        this.deadline = None;

        Poll::Ready(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test(start_paused = true)]
    async fn inactive_timer_never_fires() {
        let mut timer = DeferredTimer::new(Duration::from_millis(10));
        assert!(timeout(Duration::from_secs(1), &mut timer).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn armed_timer_fires_after_duration() {
        let mut timer = DeferredTimer::new(Duration::from_millis(50));
        let started = Instant::now();

        timer.start();
        (&mut timer).await;

        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(!timer.is_elapsed());
    }

    #[tokio::test(start_paused = true)]
    async fn passed_deadline_is_reported_before_polling() {
        let mut timer = DeferredTimer::new(Duration::from_millis(50));
        assert!(!timer.is_elapsed());

        timer.start();
        tokio::time::advance(Duration::from_millis(20)).await;
        assert!(!timer.is_elapsed());

        tokio::time::advance(Duration::from_millis(30)).await;
        assert!(timer.is_elapsed());

        timer.stop();
        assert!(!timer.is_elapsed());
    }

    #[tokio::test(start_paused = true)]
    async fn start_if_inactive_keeps_existing_deadline() {
        let mut timer = DeferredTimer::new(Duration::from_millis(50));
        let started = Instant::now();

        timer.start();
        tokio::time::sleep(Duration::from_millis(30)).await;
        timer.start_if_inactive();
        (&mut timer).await;

        assert!(started.elapsed() < Duration::from_millis(80));
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_timer_does_not_fire() {
        let mut timer = DeferredTimer::new(Duration::from_millis(10));
        timer.start();
        timer.stop();

        assert!(timeout(Duration::from_secs(1), &mut timer).await.is_err());
    }
}
