//! Index and constraint workers.
//!
//! An index queue item is a completed table with its whole index list; the
//! worker that picks it up builds that table's indexes one after the other,
//! which serializes same-table index builds (they would deadlock on the
//! relation lock otherwise) while distinct tables proceed in parallel across
//! workers. Each index has two tracked steps: CREATE INDEX, and when a
//! constraint is backed by the index, ALTER TABLE .. ADD CONSTRAINT.

use std::fs;

use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::bail;
use crate::catalog::{SourceIndex, SourceTable};
use crate::concurrency::queue::QueueReceiver;
use crate::error::{ErrorKind, Result};
use crate::pgsql::{ConnKind, PgConnection, qualified_name};
use crate::summary::IndexSummary;
use crate::workers::table_copy::IndexJob;
use crate::workers::CopyContext;

/// Spawns the index worker fleet.
pub fn spawn_index_workers(
    jobs: usize,
    ctx: CopyContext,
    queue: QueueReceiver<IndexJob>,
) -> JoinSet<Result<()>> {
    let mut join_set = JoinSet::new();
    for worker in 0..jobs {
        let ctx = ctx.clone();
        let queue = queue.clone();
        join_set.spawn(async move { index_worker(worker, ctx, queue).await });
    }
    join_set
}

async fn index_worker(
    worker: usize,
    ctx: CopyContext,
    queue: QueueReceiver<IndexJob>,
) -> Result<()> {
    debug!(worker, "index worker started");

    let target = PgConnection::connect(&ctx.target_pguri, ConnKind::Target).await?;

    while let Some(job) = queue.recv().await {
        for index in &job.table.indexes {
            if ctx.shutdown.is_requested() {
                bail!(ErrorKind::ShuttingDown, "shutdown requested");
            }

            match build_index(&ctx, &target, &job.table, index).await {
                Ok(()) => {}
                Err(err) if err.is_shutdown() => return Err(err),
                Err(err) if ctx.fail_fast => return Err(err),
                Err(err) => ctx.record_error(err),
            }
        }
    }

    debug!(worker, "index worker done");
    Ok(())
}

/// Runs the CREATE INDEX step and then the constraint step when the index
/// backs one. Two separate done files track the two steps.
async fn build_index(
    ctx: &CopyContext,
    target: &PgConnection,
    table: &SourceTable,
    index: &SourceIndex,
) -> Result<()> {
    let paths = ctx.paths.index_paths(index.index_oid);

    if !(ctx.resume && paths.done_file.exists()) {
        let command = if ctx.resume {
            index_def_if_not_exists(&index.index_def)
        } else {
            index.index_def.clone()
        };

        let mut summary = IndexSummary::new(
            std::process::id(),
            index.index_oid,
            &index.nspname,
            &index.relname,
            command.clone(),
        );
        summary.open(&paths.lock_file)?;

        info!(index = %qualified_name(&index.nspname, &index.relname), "creating index");
        target.execute(&command).await?;

        summary.finish(&paths.done_file)?;
        let _ = fs::remove_file(&paths.lock_file);
    }

    if !index.has_constraint() {
        return Ok(());
    }

    if ctx.resume && paths.constraint_done_file.exists() {
        return Ok(());
    }

    let command = constraint_sql_for(table, index);
    let mut summary = IndexSummary::new(
        std::process::id(),
        index.constraint_oid,
        &index.nspname,
        &index.constraint_name,
        command.clone(),
    );
    summary.open(&paths.constraint_lock_file)?;

    info!(constraint = %index.constraint_name, table = %table.qualified_name(), "adding constraint");
    target.execute(&command).await?;

    summary.finish(&paths.constraint_done_file)?;
    let _ = fs::remove_file(&paths.constraint_lock_file);

    Ok(())
}

/// Rewrites a pg_get_indexdef command to tolerate an index that was already
/// created by an interrupted run.
fn index_def_if_not_exists(index_def: &str) -> String {
    for prefix in ["CREATE UNIQUE INDEX ", "CREATE INDEX "] {
        if let Some(rest) = index_def.strip_prefix(prefix) {
            return format!("{prefix}IF NOT EXISTS {rest}");
        }
    }
    index_def.to_string()
}

/// Builds the ALTER TABLE statement attaching the constraint to the already
/// built index. Primary key and unique constraints can adopt the index
/// directly; anything else replays the constraint definition.
pub(crate) fn constraint_sql_for(table: &SourceTable, index: &SourceIndex) -> String {
    let table_name = table.qualified_name();
    let constraint = pg_escape::quote_identifier(&index.constraint_name);
    let index_name = pg_escape::quote_identifier(&index.relname);

    if index.constraint_def.starts_with("PRIMARY KEY") {
        format!(
            "ALTER TABLE {table_name} ADD CONSTRAINT {constraint} PRIMARY KEY USING INDEX {index_name}"
        )
    } else if index.constraint_def.starts_with("UNIQUE") {
        format!(
            "ALTER TABLE {table_name} ADD CONSTRAINT {constraint} UNIQUE USING INDEX {index_name}"
        )
    } else {
        format!(
            "ALTER TABLE {table_name} ADD CONSTRAINT {constraint} {}",
            index.constraint_def
        )
    }
}
