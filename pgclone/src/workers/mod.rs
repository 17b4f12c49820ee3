//! Worker fleets for the table data phase.
//!
//! Each fleet is a set of tokio tasks in a [`JoinSet`], all consuming the
//! same bounded queue and exiting when the queue closes. Workers own their
//! database connections; nothing is shared but the work directory, the
//! queues, and the shutdown signal.

pub mod blobs;
pub mod index;
pub mod table_copy;
pub mod vacuum;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::error;

use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{Error, ErrorKind, Result};
use crate::pgclone_error;
use crate::snapshot::WorkerSnapshot;
use crate::workdir::CopyFilePaths;

/// Everything a data-phase worker needs, cloned into each task.
#[derive(Clone)]
pub struct CopyContext {
    pub paths: Arc<CopyFilePaths>,
    pub snapshot: WorkerSnapshot,
    pub target_pguri: String,
    pub resume: bool,
    /// When false, per-table errors are recorded and siblings continue.
    pub fail_fast: bool,
    pub shutdown: ShutdownRx,
    pub errors: SharedErrors,
    /// Critical section for shared per-table file updates (truncate marker,
    /// last-part detection). Not a concurrency limiter.
    pub table_semaphore: Arc<Semaphore>,
}

impl CopyContext {
    /// Errors a worker hit on one step without aborting the run
    /// (--fail-fast=false); drained by the orchestrator at the end.
    pub fn record_error(&self, err: Error) {
        error!(error = %err, "step failed, continuing with remaining work");
        self.errors.push(err);
    }
}

/// Error sink shared by the whole fleet.
#[derive(Clone, Default)]
pub struct SharedErrors(Arc<Mutex<Vec<Error>>>);

impl SharedErrors {
    pub fn push(&self, err: Error) {
        self.0.lock().expect("errors mutex poisoned").push(err);
    }

    pub fn take(&self) -> Vec<Error> {
        std::mem::take(&mut *self.0.lock().expect("errors mutex poisoned"))
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().expect("errors mutex poisoned").is_empty()
    }
}

/// Tables whose completion was already published to the index and vacuum
/// queues in this run; guards against double publication when several parts
/// of one table finish close together.
#[derive(Clone, Default)]
pub struct PublishedTables(Arc<Mutex<HashSet<u32>>>);

impl PublishedTables {
    /// True when the caller claimed the publication for this table.
    pub fn claim(&self, oid: u32) -> bool {
        self.0.lock().expect("published mutex poisoned").insert(oid)
    }
}

/// Waits for a whole fleet, collecting worker failures. Shutdown returns and
/// task cancellations are not failures.
pub async fn drain_workers(mut join_set: JoinSet<Result<()>>) -> Vec<Error> {
    let mut errors = Vec::new();

    while let Some(result) = join_set.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) if err.is_shutdown() => {}
            Ok(Err(err)) => errors.push(err),
            Err(join_err) if join_err.is_cancelled() => {}
            Err(join_err) => errors.push(pgclone_error!(
                ErrorKind::WorkerPanic,
                "worker task panicked",
                join_err
            )),
        }
    }

    errors
}
