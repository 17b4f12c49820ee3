//! Bounded first-in-first-out work queues.
//!
//! A queue has one producing side owned by the orchestrator and any number of
//! consuming workers. Closing is signalled by dropping the sender: receivers
//! drain what is buffered and then observe the end of the queue, which is the
//! workers' signal to exit.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};

use crate::error::{ErrorKind, Result};
use crate::pgclone_error;

/// Producer half of a bounded work queue.
#[derive(Debug)]
pub struct QueueSender<T> {
    tx: mpsc::Sender<T>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        QueueSender { tx: self.tx.clone() }
    }
}

impl<T> QueueSender<T> {
    /// Sends one item, waiting while the queue is full.
    ///
    /// Fails only when every receiver is gone, which means the workers died;
    /// the caller should stop dispatching.
    pub async fn send(&self, item: T) -> Result<()> {
        self.tx.send(item).await.map_err(|_| {
            pgclone_error!(
                ErrorKind::WorkerFailed,
                "work queue is closed, no worker is listening"
            )
        })
    }

    /// Closes the queue: consumed senders stop workers once the buffered
    /// items drain.
    pub fn close(self) {}
}

/// Consumer half of a bounded work queue, shared by a worker fleet.
#[derive(Debug)]
pub struct QueueReceiver<T> {
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
}

impl<T> Clone for QueueReceiver<T> {
    fn clone(&self) -> Self {
        QueueReceiver { rx: Arc::clone(&self.rx) }
    }
}

impl<T> QueueReceiver<T> {
    /// Receives the next item, or `None` once the queue is closed and empty.
    pub async fn recv(&self) -> Option<T> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }
}

/// Creates a bounded queue with the given capacity.
pub fn bounded<T>(capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        QueueSender { tx },
        QueueReceiver { rx: Arc::new(Mutex::new(rx)) },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn receivers_drain_then_observe_close() {
        let (tx, rx) = bounded(4);
        tx.send(1u32).await.unwrap();
        tx.send(2u32).await.unwrap();
        tx.close();

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn items_fan_out_across_consumers() {
        let (tx, rx) = bounded(8);
        for item in 0..8u32 {
            tx.send(item).await.unwrap();
        }
        tx.close();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let rx = rx.clone();
            handles.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(item) = rx.recv().await {
                    seen.push(item);
                }
                seen
            }));
        }

        let mut all: Vec<u32> = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort_unstable();
        assert_eq!(all, (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn send_fails_once_workers_are_gone() {
        let (tx, rx) = bounded::<u32>(1);
        drop(rx);

        let err = tx.send(1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WorkerFailed);
    }
}
