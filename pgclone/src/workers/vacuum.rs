//! Vacuum workers.
//!
//! Freshly loaded tables have no statistics and no visibility map; the
//! vacuum queue receives each table as soon as its COPY completes so VACUUM
//! ANALYZE runs concurrently with the remaining copies and index builds.

use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::bail;
use crate::concurrency::queue::QueueReceiver;
use crate::error::{ErrorKind, Result};
use crate::pgsql::{ConnKind, PgConnection};
use crate::workers::table_copy::VacuumJob;
use crate::workers::CopyContext;

/// Spawns the vacuum worker fleet.
pub fn spawn_vacuum_workers(
    jobs: usize,
    ctx: CopyContext,
    queue: QueueReceiver<VacuumJob>,
) -> JoinSet<Result<()>> {
    let mut join_set = JoinSet::new();
    for worker in 0..jobs {
        let ctx = ctx.clone();
        let queue = queue.clone();
        join_set.spawn(async move { vacuum_worker(worker, ctx, queue).await });
    }
    join_set
}

async fn vacuum_worker(
    worker: usize,
    ctx: CopyContext,
    queue: QueueReceiver<VacuumJob>,
) -> Result<()> {
    debug!(worker, "vacuum worker started");

    let target = PgConnection::connect(&ctx.target_pguri, ConnKind::Target).await?;

    while let Some(job) = queue.recv().await {
        if ctx.shutdown.is_requested() {
            bail!(ErrorKind::ShuttingDown, "shutdown requested");
        }

        let sql = format!("VACUUM ANALYZE {}", job.table.qualified_name());
        info!(table = %job.table.qualified_name(), "vacuum analyze");

        match target.simple_query(&sql).await {
            Ok(_) => {}
            Err(err) if ctx.fail_fast => return Err(err),
            Err(err) => ctx.record_error(err),
        }
    }

    debug!(worker, "vacuum worker done");
    Ok(())
}
