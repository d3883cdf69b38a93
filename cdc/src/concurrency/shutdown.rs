//! Cooperative shutdown signalling.
//!
//! Shutdown is a watch channel of unit values. Sending marks every receiver as changed, so
//! tasks observe it with [`tokio::sync::watch::Receiver::changed`] in a `select!` or poll it
//! between units of work with [`tokio::sync::watch::Receiver::has_changed`].

use tokio::sync::watch;

/// Receiver side of the shutdown channel.
pub type ShutdownRx = watch::Receiver<()>;

/// Sender side of the shutdown channel.
#[derive(Debug, Clone)]
pub struct ShutdownTx(watch::Sender<()>);

impl ShutdownTx {
    /// Requests shutdown of every task holding a receiver.
    ///
    /// Fails when no receiver is alive anymore.
    pub fn shutdown(&self) -> Result<(), watch::error::SendError<()>> {
        self.0.send(())
    }

    /// Creates a new receiver that observes shutdowns requested from now on.
    pub fn subscribe(&self) -> ShutdownRx {
        self.0.subscribe()
    }
}

/// Creates a new shutdown channel.
pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(());
    (ShutdownTx(tx), rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_observe_shutdown() {
        let (tx, mut rx) = create_shutdown_channel();
        let late_rx = tx.subscribe();

        assert!(!rx.has_changed().unwrap());
        tx.shutdown().unwrap();

        assert!(late_rx.has_changed().unwrap());
        rx.changed().await.unwrap();
    }

    #[test]
    fn shutdown_without_receivers_fails() {
        let (tx, rx) = create_shutdown_channel();
        drop(rx);

        assert!(tx.shutdown().is_err());
    }

    #[test]
    fn dropped_sender_closes_receivers() {
        let (tx, rx) = create_shutdown_channel();
        drop(tx);

        assert!(rx.has_changed().is_err());
    }
}
