//! Source transaction snapshot management.
//!
//! A consistent copy needs every worker connection to see the same point in
//! time. The main process either exports a fresh snapshot or adopts one the
//! user exported elsewhere, keeps the owning transaction open for the whole
//! run, and hands the snapshot identifier to worker connections which adopt
//! it with SET TRANSACTION SNAPSHOT before their first read.

use std::fs;
use std::path::Path;

use tracing::{debug, info};

use crate::error::{ErrorKind, Result};
use crate::pgclone_error;
use crate::pgsql::{ConnKind, IsolationLevel, PgConnection};

/// Lifecycle of the snapshot-owning connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotState {
    Unknown,
    /// A fresh snapshot was exported by this process.
    Exported,
    /// A user-provided snapshot was adopted.
    Set,
    /// Running with --not-consistent, no snapshot is held.
    Skipped,
    Closed,
}

/// The snapshot-owning source connection and its exported identifier.
pub struct SourceSnapshot {
    pguri: String,
    consistent: bool,
    snapshot: Option<String>,
    state: SnapshotState,
    connection: Option<PgConnection>,
}

impl SourceSnapshot {
    /// `snapshot` is the user-provided identifier, if any.
    pub fn new(pguri: &str, consistent: bool, snapshot: Option<String>) -> Self {
        SourceSnapshot {
            pguri: pguri.to_string(),
            consistent,
            snapshot,
            state: SnapshotState::Unknown,
            connection: None,
        }
    }

    /// Exports or adopts the snapshot and persists its identifier.
    ///
    /// Any failure here is fatal for the whole run: without the snapshot
    /// there is no consistency story to offer.
    pub async fn prepare(&mut self, snapshot_file: &Path) -> Result<()> {
        if !self.consistent {
            debug!("running with --not-consistent, skipping snapshot export");
            self.state = SnapshotState::Skipped;
            return Ok(());
        }

        let conn = PgConnection::connect(&self.pguri, ConnKind::Source).await?;
        conn.begin().await?;

        // SET TRANSACTION SNAPSHOT requires serializable or repeatable read,
        // and exporting needs the same; read-write because the same
        // transaction may create temp objects, deferrable to stay out of the
        // way of concurrent writers.
        match &self.snapshot {
            Some(snapshot) => {
                conn.set_transaction(IsolationLevel::RepeatableRead, false, true)
                    .await
                    .map_err(snapshot_error)?;
                conn.set_snapshot(snapshot).await.map_err(snapshot_error)?;
                self.state = SnapshotState::Set;
                info!(snapshot, "using the given snapshot on the source database");
            }
            None => {
                conn.set_transaction(IsolationLevel::Serializable, false, true)
                    .await
                    .map_err(snapshot_error)?;
                let snapshot = conn.export_snapshot().await.map_err(snapshot_error)?;
                info!(snapshot, "exported snapshot from the source database");
                self.snapshot = Some(snapshot);
                self.state = SnapshotState::Exported;
            }
        }

        // Persist the identifier to support --resume --snapshot later.
        let snapshot = self.snapshot.as_deref().unwrap_or_default();
        fs::write(snapshot_file, format!("{snapshot}\n"))?;

        self.connection = Some(conn);
        Ok(())
    }

    /// The snapshot identifier, when one is held.
    pub fn id(&self) -> Option<&str> {
        match self.state {
            SnapshotState::Skipped => None,
            _ => self.snapshot.as_deref(),
        }
    }

    pub fn state(&self) -> SnapshotState {
        self.state
    }

    /// The connection holding the snapshot open, usable for catalog queries
    /// bounded by the same snapshot.
    pub fn connection(&self) -> Option<&PgConnection> {
        self.connection.as_ref()
    }

    /// Value-copy of what a worker needs to adopt the snapshot on its own
    /// connection.
    pub fn to_worker(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            pguri: self.pguri.clone(),
            snapshot: self.id().map(str::to_string),
        }
    }

    /// Commits and disconnects; idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.connection.take() {
            conn.commit().await?;
        }
        self.state = SnapshotState::Closed;
        Ok(())
    }
}

fn snapshot_error(err: crate::error::Error) -> crate::error::Error {
    pgclone_error!(
        ErrorKind::SnapshotFailed,
        "failed to prepare the source snapshot",
        err
    )
}

/// Snapshot hand-off for worker connections.
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pguri: String,
    snapshot: Option<String>,
}

impl WorkerSnapshot {
    /// Opens a worker connection to the source, inside a repeatable-read
    /// transaction pinned to the shared snapshot when one is held.
    pub async fn connect(&self) -> Result<PgConnection> {
        let conn = PgConnection::connect(&self.pguri, ConnKind::Source).await?;

        if let Some(snapshot) = &self.snapshot {
            conn.begin().await?;
            conn.set_transaction(IsolationLevel::RepeatableRead, true, true)
                .await
                .map_err(snapshot_error)?;
            conn.set_snapshot(snapshot).await.map_err(snapshot_error)?;
        }

        Ok(conn)
    }

    pub fn pguri(&self) -> &str {
        &self.pguri
    }

    pub fn snapshot(&self) -> Option<&str> {
        self.snapshot.as_deref()
    }
}
