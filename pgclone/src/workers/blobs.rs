//! Large objects worker.
//!
//! A single worker copies every large object, running concurrently with the
//! table data phase on its own pair of connections. Large objects are not
//! covered by pg_dump's data sections when dumping schema only, so they are
//! transferred here oid by oid.

use std::time::Instant;

use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::bail;
use crate::error::{ErrorKind, Result};
use crate::pgsql::{ConnKind, PgConnection};
use crate::summary::BlobsSummary;
use crate::workers::CopyContext;

/// Spawns the single large-objects worker.
pub fn spawn_blobs_worker(ctx: CopyContext) -> JoinSet<Result<()>> {
    let mut join_set = JoinSet::new();
    join_set.spawn(async move { copy_large_objects(ctx).await });
    join_set
}

async fn copy_large_objects(ctx: CopyContext) -> Result<()> {
    let done_file = &ctx.paths.done.blobs;

    if ctx.resume && done_file.exists() {
        debug!("large objects already copied, skipping");
        return Ok(());
    }

    let source = ctx.snapshot.connect().await?;
    let target = PgConnection::connect(&ctx.target_pguri, ConnKind::Target).await?;

    let started = Instant::now();
    let mut count: u64 = 0;

    let oids = source
        .query(
            "SELECT oid FROM pg_catalog.pg_largeobject_metadata ORDER BY oid",
            &[],
        )
        .await?;

    info!(count = oids.len(), "copying large objects");

    for row in oids {
        if ctx.shutdown.is_requested() {
            bail!(ErrorKind::ShuttingDown, "shutdown requested");
        }

        let oid: u32 = row.get(0);
        copy_one_large_object(&source, &target, oid).await?;
        count += 1;
    }

    let summary = BlobsSummary {
        pid: std::process::id(),
        count,
        duration_ms: started.elapsed().as_millis() as u64,
    };
    summary.write(done_file)?;

    info!(count, "large objects copied");
    Ok(())
}

async fn copy_one_large_object(
    source: &PgConnection,
    target: &PgConnection,
    oid: u32,
) -> Result<()> {
    // A leftover object with the same oid would make lo_create fail; unlink
    // first and ignore the error for the common case where none exists.
    let _ = target
        .query_one("SELECT pg_catalog.lo_unlink($1::oid)", &[&oid])
        .await;

    target
        .query_one("SELECT pg_catalog.lo_create($1::oid)", &[&oid])
        .await?;

    let row = source
        .query_one("SELECT pg_catalog.lo_get($1::oid)", &[&oid])
        .await?;
    let data: Vec<u8> = row.get(0);

    target
        .query_one("SELECT pg_catalog.lo_put($1::oid, 0, $2)", &[&oid, &data])
        .await?;

    debug!(oid, bytes = data.len(), "copied large object");
    Ok(())
}
