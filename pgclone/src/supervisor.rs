//! Signal handling and fatal termination.
//!
//! The supervisor owns the shutdown channel. SIGINT and SIGTERM flip the
//! "quit asked" flag; long-running workers poll it at their safe points and
//! wind down cooperatively. Database I/O in flight finishes its current
//! statement, and open transactions that have not committed are rolled back
//! by the server when their connection closes.

use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::concurrency::shutdown::{ShutdownRx, ShutdownTx, create_shutdown};
use crate::error::{Error, Result};

/// Owns the shutdown channel and the signal listener task.
pub struct Supervisor {
    shutdown_tx: ShutdownTx,
    shutdown_rx: ShutdownRx,
    listener: Option<JoinHandle<()>>,
}

impl Supervisor {
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = create_shutdown();
        Supervisor {
            shutdown_tx,
            shutdown_rx,
            listener: None,
        }
    }

    /// A receiver for a worker to poll.
    pub fn subscribe(&self) -> ShutdownRx {
        self.shutdown_rx.clone()
    }

    /// Requests a shutdown programmatically (fatal error paths).
    pub fn trigger(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Installs SIGINT/SIGTERM handlers that request a shutdown.
    pub fn listen_for_signals(&mut self) -> Result<()> {
        let shutdown_tx = self.shutdown_tx.clone();

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        self.listener = Some(tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("sigterm received, asking workers to stop");
                }
                _ = sigint.recv() => {
                    info!("sigint received, asking workers to stop");
                }
            }
            let _ = shutdown_tx.send(true);
        }));

        Ok(())
    }

    /// Stops listening; called once the run completed on its own.
    pub fn stop_listening(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop_listening();
    }
}

/// Turns the collected worker failures into the run outcome: logging every
/// error and returning an aggregate failure when any worker failed.
pub fn drain_outcome(errors: Vec<Error>) -> Result<()> {
    if errors.is_empty() {
        return Ok(());
    }
    for err in &errors {
        error!(error = %err, "worker failed");
    }
    Err(Error::from_many(errors))
}
