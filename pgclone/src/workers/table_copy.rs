//! Table COPY workers.
//!
//! Each worker owns one snapshot-pinned source connection and one target
//! connection, and loops over the table queue. A queue item is either a whole
//! table or one part of a partitioned table. When the last piece of a table
//! finishes, the worker publishes the table to the index and vacuum queues.

use std::fs;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::bail;
use crate::catalog::{SourceTable, TablePart};
use crate::concurrency::queue::{QueueReceiver, QueueSender};
use crate::error::{ErrorKind, Result};
use crate::pgsql::{ConnKind, PgConnection, copy_stream};
use crate::summary::{TableSummary, write_index_list};
use crate::workdir::TableFilePaths;
use crate::workers::{CopyContext, PublishedTables};

/// One unit of COPY work: a table, or one part of it.
#[derive(Debug, Clone)]
pub struct TableCopyJob {
    pub table: Arc<SourceTable>,
    pub part: Option<TablePart>,
}

impl TableCopyJob {
    fn paths(&self, ctx: &CopyContext) -> TableFilePaths {
        match &self.part {
            Some(part) => ctx.paths.table_part_paths(self.table.oid, part.part_number),
            None => ctx.paths.table_paths(self.table.oid),
        }
    }
}

/// A completed table handed to the index workers.
#[derive(Debug, Clone)]
pub struct IndexJob {
    pub table: Arc<SourceTable>,
}

/// A completed table handed to the vacuum workers.
#[derive(Debug, Clone)]
pub struct VacuumJob {
    pub table: Arc<SourceTable>,
}

/// Spawns the COPY worker fleet.
///
/// The queue senders are absent when only the table data phase runs: done
/// tables then have nowhere to go, but the progress files are still written.
pub fn spawn_table_copy_workers(
    jobs: usize,
    ctx: CopyContext,
    queue: QueueReceiver<TableCopyJob>,
    index_queue: Option<QueueSender<IndexJob>>,
    vacuum_queue: Option<QueueSender<VacuumJob>>,
) -> JoinSet<Result<()>> {
    let published = PublishedTables::default();
    let mut join_set = JoinSet::new();

    for worker in 0..jobs {
        let ctx = ctx.clone();
        let queue = queue.clone();
        let index_queue = index_queue.clone();
        let vacuum_queue = vacuum_queue.clone();
        let published = published.clone();
        join_set.spawn(async move {
            table_copy_worker(worker, ctx, queue, index_queue, vacuum_queue, published).await
        });
    }

    join_set
}

async fn table_copy_worker(
    worker: usize,
    ctx: CopyContext,
    queue: QueueReceiver<TableCopyJob>,
    index_queue: Option<QueueSender<IndexJob>>,
    vacuum_queue: Option<QueueSender<VacuumJob>>,
    published: PublishedTables,
) -> Result<()> {
    debug!(worker, "table copy worker started");

    let source = ctx.snapshot.connect().await?;
    let target = PgConnection::connect(&ctx.target_pguri, ConnKind::Target).await?;

    while let Some(job) = queue.recv().await {
        if ctx.shutdown.is_requested() {
            bail!(ErrorKind::ShuttingDown, "shutdown requested");
        }

        match copy_table_job(&ctx, &source, &target, &job).await {
            Ok(()) => {
                publish_if_complete(&ctx, &job, &published, &index_queue, &vacuum_queue).await?;
            }
            Err(err) if err.is_shutdown() => return Err(err),
            Err(err) if ctx.fail_fast => return Err(err),
            Err(err) => ctx.record_error(err),
        }
    }

    debug!(worker, "table copy worker done");
    Ok(())
}

/// Copies one table or part, tracked by its lock and done files.
async fn copy_table_job(
    ctx: &CopyContext,
    source: &PgConnection,
    target: &PgConnection,
    job: &TableCopyJob,
) -> Result<()> {
    let table = &job.table;
    let paths = job.paths(ctx);

    if ctx.resume && paths.done_file.exists() {
        debug!(table = %table.qualified_name(), "copy already done, skipping");
        return Ok(());
    }

    if let Some(owner) = lock_file_owner(&paths)? {
        info!(
            table = %table.qualified_name(),
            pid = owner,
            "table is being copied by another process, skipping"
        );
        return Ok(());
    }

    // A part range can come up empty when the plan was computed against an
    // earlier catalog; record the step as done without issuing any COPY.
    if let Some(part) = &job.part
        && part.min > part.max
    {
        let mut summary = empty_part_summary(table, part);
        summary.open(&paths.lock_file)?;
        summary.finish(&paths.done_file)?;
        let _ = fs::remove_file(&paths.lock_file);
        return Ok(());
    }

    truncate_table(ctx, target, job, &paths).await?;

    let copy_out_sql = table.copy_out_sql(job.part.as_ref());
    let mut summary = TableSummary::new(
        std::process::id(),
        table.oid,
        &table.nspname,
        &table.relname,
        copy_out_sql.clone(),
    );
    summary.open(&paths.lock_file)?;

    info!(
        table = %table.qualified_name(),
        part = job.part.as_ref().map(|part| part.part_number),
        bytes = %table.bytes_pretty,
        "copying table data"
    );

    let rows = copy_stream(source, target, &copy_out_sql, &table.copy_in_sql()).await?;
    debug!(table = %table.qualified_name(), rows, "copy complete");

    summary.finish(&paths.done_file)?;
    let _ = fs::remove_file(&paths.lock_file);

    Ok(())
}

/// Returns the live owner of the lock file, removing a stale one.
fn lock_file_owner(paths: &TableFilePaths) -> Result<Option<u32>> {
    if !paths.lock_file.exists() {
        return Ok(None);
    }

    let summary = TableSummary::read(&paths.lock_file)?;
    if summary.pid != std::process::id() && crate::workdir::pid_is_running(summary.pid) {
        return Ok(Some(summary.pid));
    }

    debug!(pid = summary.pid, "taking over a dead process' table lock file");
    fs::remove_file(&paths.lock_file)?;
    Ok(None)
}

/// Truncates the target table before loading data into it. Partitioned
/// tables are truncated exactly once, the parts racing for the marker file
/// under the table critical section.
async fn truncate_table(
    ctx: &CopyContext,
    target: &PgConnection,
    job: &TableCopyJob,
    paths: &TableFilePaths,
) -> Result<()> {
    let truncate_sql = format!("TRUNCATE {}", job.table.qualified_name());

    if job.part.is_none() {
        target.execute(&truncate_sql).await?;
        return Ok(());
    }

    let _permit = ctx.table_semaphore.acquire().await.expect("semaphore closed");
    if paths.truncate_done_file.exists() {
        return Ok(());
    }
    target.execute(&truncate_sql).await?;
    fs::write(&paths.truncate_done_file, b"")?;

    Ok(())
}

fn empty_part_summary(table: &SourceTable, part: &TablePart) -> TableSummary {
    TableSummary::new(
        std::process::id(),
        table.oid,
        &table.nspname,
        &table.relname,
        format!(
            "-- empty range {}..{} of part {}/{}",
            part.min, part.max, part.part_number, part.part_count
        ),
    )
}

/// After a piece of a table finished, decides whether the whole table is
/// complete and, exactly once per table, hands it to the index and vacuum
/// workers. Only the first partition writes the index list file.
async fn publish_if_complete(
    ctx: &CopyContext,
    job: &TableCopyJob,
    published: &PublishedTables,
    index_queue: &Option<QueueSender<IndexJob>>,
    vacuum_queue: &Option<QueueSender<VacuumJob>>,
) -> Result<()> {
    let table = &job.table;

    let complete = match &job.part {
        None => {
            write_index_list(
                &job.paths(ctx).idx_list_file,
                &table.index_oid_pairs(),
            )?;
            // A live lock holder in another process means the COPY is still
            // running there; only a done file makes the table complete.
            job.paths(ctx).done_file.exists()
        }
        Some(part) => {
            if part.part_number == 0 {
                write_index_list(
                    &job.paths(ctx).idx_list_file,
                    &table.index_oid_pairs(),
                )?;
            }

            let _permit = ctx.table_semaphore.acquire().await.expect("semaphore closed");
            (0..part.part_count).all(|number| {
                ctx.paths
                    .table_part_paths(table.oid, number)
                    .done_file
                    .exists()
            })
        }
    };

    if !complete || !published.claim(table.oid) {
        return Ok(());
    }

    debug!(table = %table.qualified_name(), "table complete, publishing to index and vacuum queues");

    if let Some(index_queue) = index_queue {
        index_queue
            .send(IndexJob { table: Arc::clone(table) })
            .await?;
    }
    if let Some(vacuum_queue) = vacuum_queue {
        vacuum_queue
            .send(VacuumJob { table: Arc::clone(table) })
            .await?;
    }

    Ok(())
}
