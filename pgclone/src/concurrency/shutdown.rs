//! Graceful shutdown signalling.
//!
//! A single watch channel carries the "quit asked" flag from the supervisor
//! to every worker. Workers poll it at safe points: between tables, between
//! queue items, between replayed statements. Nothing is cancelled at an
//! arbitrary await point.

use tokio::sync::watch;

/// Sender side of the shutdown signal, owned by the supervisor.
pub type ShutdownTx = watch::Sender<bool>;

/// Receiver side of the shutdown signal, cloned into every worker.
#[derive(Debug, Clone)]
pub struct ShutdownRx(watch::Receiver<bool>);

impl ShutdownRx {
    /// True once shutdown was requested; cheap enough to poll per item.
    pub fn is_requested(&self) -> bool {
        *self.0.borrow()
    }

    /// Waits until shutdown is requested.
    pub async fn requested(&mut self) {
        // An error means the sender is gone, which only happens on teardown;
        // treat it the same as a request.
        let _ = self.0.wait_for(|requested| *requested).await;
    }
}

/// Creates the shutdown channel, initially not requested.
pub fn create_shutdown() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(false);
    (tx, ShutdownRx(rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn flag_starts_clear_and_latches() {
        let (tx, rx) = create_shutdown();
        assert!(!rx.is_requested());

        tx.send(true).unwrap();
        assert!(rx.is_requested());
    }

    #[tokio::test]
    async fn requested_wakes_waiters() {
        let (tx, rx) = create_shutdown();

        let mut waiter = rx.clone();
        let handle = tokio::spawn(async move {
            waiter.requested().await;
            true
        });

        tx.send(true).unwrap();
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn clones_observe_the_same_signal() {
        let (tx, rx) = create_shutdown();
        let other = rx.clone();
        tx.send(true).unwrap();
        assert!(rx.is_requested());
        assert!(other.is_requested());
    }
}
