//! The apply process: replay SQL files on the target.
//!
//! Files are consumed strictly by first LSN. Each transaction replays inside
//! a target transaction whose commit also records the source commit LSN in
//! the replication origin, so a crash resumes exactly at the first
//! unreplayed transaction: everything at or below the origin progress is
//! skipped, everything above is replayed.

use std::fs;
use std::path::Path;
use std::time::Duration;

use tokio_postgres::types::PgLsn;
use tracing::{debug, info};

use crate::bail;
use crate::cdc::messages::StreamAction;
use crate::cdc::transform::{parse_sql_marker, transform_file};
use crate::cdc::{StreamDbContext, StreamSpecs, segment_start, sentinel, sql_file_path};
use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{ErrorKind, Result};
use crate::pgclone_error;
use crate::pgsql::{ConnKind, PgConnection};

/// How long apply sleeps when it has caught up with the stream.
const REPLAY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Whether apply stops when it runs out of files or waits for more.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Replay what is on disk, then return.
    Catchup,
    /// Keep waiting for the receive process to produce more files.
    Replay,
}

/// What the apply run achieved.
#[derive(Debug, Clone, Copy)]
pub struct ApplyOutcome {
    pub reached_endpos: bool,
    pub replay_lsn: PgLsn,
}

/// One parsed element of a SQL file.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyEntry {
    Transaction(SqlTransaction),
    Keepalive { lsn: PgLsn, timestamp: String },
    SwitchWal { lsn: PgLsn },
}

/// A replayable transaction recovered from the file's metadata comments.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlTransaction {
    pub xid: u32,
    pub begin_lsn: PgLsn,
    pub commit_lsn: PgLsn,
    pub timestamp: String,
    pub statements: Vec<String>,
}

/// Parses a SQL file back into its transactions and markers, using only the
/// metadata comments transform wrote.
pub fn parse_sql_file(path: &Path) -> Result<Vec<ApplyEntry>> {
    let contents = fs::read_to_string(path)?;
    let mut entries = Vec::new();
    let mut current: Option<SqlTransaction> = None;

    for line in contents.lines() {
        if line.is_empty() {
            continue;
        }

        match parse_sql_marker(line)? {
            Some((StreamAction::Begin, metadata)) => {
                if current.is_some() {
                    bail!(
                        ErrorKind::InvalidCdcMessage,
                        "nested BEGIN in sql file",
                        format!("{path:?}")
                    );
                }
                current = Some(SqlTransaction {
                    xid: metadata.xid,
                    begin_lsn: metadata.lsn,
                    commit_lsn: PgLsn::from(0u64),
                    timestamp: metadata.timestamp,
                    statements: Vec::new(),
                });
            }
            Some((StreamAction::Commit, metadata)) => {
                let Some(mut transaction) = current.take() else {
                    bail!(
                        ErrorKind::InvalidCdcMessage,
                        "COMMIT without BEGIN in sql file",
                        format!("{path:?}")
                    );
                };
                transaction.commit_lsn = metadata.lsn;
                entries.push(ApplyEntry::Transaction(transaction));
            }
            Some((StreamAction::Keepalive, metadata)) => match current.as_mut() {
                // Keepalives inside a transaction only matter between them.
                Some(_) => {}
                None => entries.push(ApplyEntry::Keepalive {
                    lsn: metadata.lsn,
                    timestamp: metadata.timestamp,
                }),
            },
            Some((StreamAction::SwitchWal, metadata)) => {
                if current.is_none() {
                    entries.push(ApplyEntry::SwitchWal { lsn: metadata.lsn });
                }
            }
            Some(_) => {}
            None => match current.as_mut() {
                Some(transaction) => transaction.statements.push(line.to_string()),
                None => {
                    bail!(
                        ErrorKind::InvalidCdcMessage,
                        "statement outside of a transaction in sql file",
                        format!("{path:?}: {line}")
                    );
                }
            },
        }
    }

    Ok(entries)
}

/// Replay decision for one transaction against the current origin progress.
fn already_applied(commit_lsn: PgLsn, progress: Option<PgLsn>) -> bool {
    match progress {
        Some(progress) => commit_lsn <= progress,
        None => false,
    }
}

/// End-position decision for one transaction: a commit strictly past the end
/// position is not applied; a commit exactly at it is applied and then the
/// stream stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndposDecision {
    Apply,
    ApplyThenStop,
    StopBeforeApply,
}

fn endpos_decision(commit_lsn: PgLsn, endpos: Option<PgLsn>) -> EndposDecision {
    match endpos {
        None => EndposDecision::Apply,
        Some(endpos) if commit_lsn > endpos => EndposDecision::StopBeforeApply,
        Some(endpos) if commit_lsn >= endpos => EndposDecision::ApplyThenStop,
        Some(_) => EndposDecision::Apply,
    }
}

/// Runs the apply role until the end position is reached, files run out
/// (catchup) or a shutdown is requested.
pub async fn stream_apply(
    specs: StreamSpecs,
    mode: ApplyMode,
    mut shutdown: ShutdownRx,
) -> Result<ApplyOutcome> {
    let source = PgConnection::connect(&specs.source_pguri, ConnKind::Source).await?;
    let target = PgConnection::connect(&specs.target_pguri, ConnKind::Target).await?;

    let context = StreamDbContext::read(&specs.paths)?.ok_or_else(|| {
        pgclone_error!(
            ErrorKind::WorkDirState,
            "no stream context found",
            "the receive process writes it, run `pgclone stream receive` first"
        )
    })?;

    let mut progress = setup_origin(&target, &specs.origin).await?;

    // Wait for the copy to finish: apply only starts once the sentinel's
    // apply switch is flipped.
    let mut record = sentinel::fetch_sentinel(&source).await?;
    while !record.apply_enabled {
        if shutdown.is_requested() {
            return Ok(ApplyOutcome {
                reached_endpos: false,
                replay_lsn: progress.unwrap_or_else(|| 0.into()),
            });
        }
        debug!("apply is disabled in the sentinel, waiting");
        tokio::time::sleep(REPLAY_POLL_INTERVAL).await;
        record = sentinel::fetch_sentinel(&source).await?;
    }
    let mut endpos = record.endpos.or(specs.endpos);

    let start = progress.unwrap_or(record.startpos).max(record.startpos);
    let mut position = segment_start(start, context.wal_segment_size);
    let mut reached_endpos = false;
    let mut replay_lsn = progress.unwrap_or_else(|| 0.into());

    info!(
        origin = %specs.origin,
        progress = %replay_lsn,
        start = %position,
        "starting to replay sql files"
    );

    'files: loop {
        if shutdown.is_requested() {
            break;
        }

        let sql_file = sql_file_path(&specs.paths, &context, position);
        if !ensure_sql_file(&specs, &context, position, &sql_file, mode)? {
            match mode {
                ApplyMode::Catchup => {
                    debug!(file = %sql_file.display(), "no more files to replay");
                    break;
                }
                ApplyMode::Replay => {
                    tokio::time::sleep(REPLAY_POLL_INTERVAL).await;
                    let record = sentinel::fetch_sentinel(&source).await?;
                    endpos = record.endpos.or(endpos);
                    continue;
                }
            }
        }

        debug!(file = %sql_file.display(), "replaying sql file");
        let mut next_position = PgLsn::from(u64::from(position) + context.wal_segment_size);

        for entry in parse_sql_file(&sql_file)? {
            if shutdown.is_requested() {
                break 'files;
            }

            match entry {
                ApplyEntry::Transaction(transaction) => {
                    if already_applied(transaction.commit_lsn, progress) {
                        debug!(
                            xid = transaction.xid,
                            commit = %transaction.commit_lsn,
                            "transaction already applied, skipping"
                        );
                        continue;
                    }

                    match endpos_decision(transaction.commit_lsn, endpos) {
                        EndposDecision::StopBeforeApply => {
                            reached_endpos = true;
                            break 'files;
                        }
                        decision => {
                            apply_transaction(&target, &transaction).await?;
                            progress = Some(transaction.commit_lsn);
                            replay_lsn = transaction.commit_lsn;

                            if decision == EndposDecision::ApplyThenStop {
                                reached_endpos = true;
                                sentinel::update_replay(&source, replay_lsn).await?;
                                break 'files;
                            }
                        }
                    }
                }
                ApplyEntry::Keepalive { .. } => {
                    // Liveness: publish progress even when no transaction is
                    // flowing. Only commit LSNs count against the end
                    // position.
                    sentinel::update_replay(&source, replay_lsn).await?;
                }
                ApplyEntry::SwitchWal { lsn } => {
                    next_position = segment_start(lsn, context.wal_segment_size);
                }
            }
        }

        sentinel::update_replay(&source, replay_lsn).await?;
        position = next_position;
    }

    sentinel::update_replay(&source, replay_lsn).await?;

    info!(
        replay = %replay_lsn,
        reached_endpos,
        "replay stopped"
    );

    Ok(ApplyOutcome {
        reached_endpos,
        replay_lsn,
    })
}

/// Makes sure the SQL file for the segment exists. In catchup mode the JSON
/// file is transformed on demand when receive fetched it but transform never
/// ran; in replay mode only files finalized by the transform worker are
/// consumed, since the worker owns segments that are still being written.
/// Returns false when the segment is not available yet.
fn ensure_sql_file(
    specs: &StreamSpecs,
    context: &StreamDbContext,
    position: PgLsn,
    sql_file: &Path,
    mode: ApplyMode,
) -> Result<bool> {
    if sql_file.exists() {
        return Ok(true);
    }
    if mode == ApplyMode::Replay {
        return Ok(false);
    }

    let json_file = crate::cdc::json_file_path(&specs.paths, context, position);
    if !json_file.exists() {
        return Ok(false);
    }

    let mut carry = None;
    transform_file(&json_file, sql_file, &mut carry)?;
    Ok(true)
}

/// Registers the session origin and reads how far it has progressed.
async fn setup_origin(target: &PgConnection, origin: &str) -> Result<Option<PgLsn>> {
    let exists = target
        .query(
            "SELECT 1 FROM pg_catalog.pg_replication_origin WHERE roname = $1",
            &[&origin],
        )
        .await?;
    if exists.is_empty() {
        bail!(
            ErrorKind::OriginFailed,
            "replication origin does not exist on the target",
            format!("{origin}: run `pgclone stream setup` first")
        );
    }

    let row = target
        .query_one(
            "SELECT pg_catalog.pg_replication_origin_progress($1, false)",
            &[&origin],
        )
        .await?;
    let progress: Option<PgLsn> = row.get(0);

    target
        .query_one(
            "SELECT pg_catalog.pg_replication_origin_session_setup($1)",
            &[&origin],
        )
        .await
        .map_err(|err| {
            pgclone_error!(
                ErrorKind::OriginFailed,
                "failed to set up the replication origin session",
                err
            )
        })?;

    Ok(progress)
}

/// Replays one transaction; the origin advance rides in the same commit.
async fn apply_transaction(target: &PgConnection, transaction: &SqlTransaction) -> Result<()> {
    debug!(
        xid = transaction.xid,
        commit = %transaction.commit_lsn,
        statements = transaction.statements.len(),
        "replaying transaction"
    );

    target.execute("BEGIN").await?;

    let result = replay_statements(target, transaction).await;
    if let Err(err) = result {
        let _ = target.rollback().await;
        return Err(err);
    }

    // Recording the source commit position inside the transaction makes the
    // origin advance atomic with the data changes.
    let setup = if transaction.timestamp.is_empty() {
        target
            .query_one(
                "SELECT pg_catalog.pg_replication_origin_xact_setup($1::pg_lsn, now())",
                &[&transaction.commit_lsn],
            )
            .await
    } else {
        target
            .query_one(
                "SELECT pg_catalog.pg_replication_origin_xact_setup($1::pg_lsn, $2::timestamptz)",
                &[&transaction.commit_lsn, &transaction.timestamp],
            )
            .await
    };
    if let Err(err) = setup {
        let _ = target.rollback().await;
        return Err(pgclone_error!(
            ErrorKind::OriginFailed,
            "failed to record the transaction origin position",
            err
        ));
    }

    target.commit().await?;
    Ok(())
}

async fn replay_statements(target: &PgConnection, transaction: &SqlTransaction) -> Result<()> {
    for statement in &transaction.statements {
        target.simple_query(statement).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn lsn(value: u64) -> PgLsn {
        PgLsn::from(value)
    }

    #[test]
    fn transactions_at_or_below_the_origin_are_skipped() {
        assert!(already_applied(lsn(0x1000), Some(lsn(0x1000))));
        assert!(already_applied(lsn(0x0FFF), Some(lsn(0x1000))));
        assert!(!already_applied(lsn(0x1001), Some(lsn(0x1000))));
        assert!(!already_applied(lsn(0x1000), None));
    }

    #[test]
    fn endpos_is_inclusive() {
        assert_eq!(endpos_decision(lsn(0x1000), None), EndposDecision::Apply);
        assert_eq!(
            endpos_decision(lsn(0x1000), Some(lsn(0x1500))),
            EndposDecision::Apply
        );
        assert_eq!(
            endpos_decision(lsn(0x1500), Some(lsn(0x1500))),
            EndposDecision::ApplyThenStop
        );
        assert_eq!(
            endpos_decision(lsn(0x2000), Some(lsn(0x1500))),
            EndposDecision::StopBeforeApply
        );
    }

    #[test]
    fn sql_files_parse_back_into_transactions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seg.sql");
        fs::write(
            &path,
            "\
-- KEEPALIVE 0/F00 2024-01-15 10:00:00+00
BEGIN; -- {\"xid\": 529, \"lsn\": \"0/1000\", \"timestamp\": \"2024-01-15 10:00:01+00\"}
INSERT INTO public.users (id) VALUES (1);
INSERT INTO public.users (id) VALUES (2);
COMMIT; -- {\"xid\": 529, \"lsn\": \"0/1100\"}
-- SWITCH WAL 0/2000000
",
        )
        .unwrap();

        let entries = parse_sql_file(&path).unwrap();
        assert_eq!(entries.len(), 3);

        let ApplyEntry::Keepalive { lsn: keepalive_lsn, .. } = &entries[0] else {
            panic!("expected keepalive first");
        };
        assert_eq!(u64::from(*keepalive_lsn), 0xF00);

        let ApplyEntry::Transaction(transaction) = &entries[1] else {
            panic!("expected a transaction");
        };
        assert_eq!(transaction.xid, 529);
        assert_eq!(u64::from(transaction.begin_lsn), 0x1000);
        assert_eq!(u64::from(transaction.commit_lsn), 0x1100);
        assert_eq!(transaction.statements.len(), 2);

        let ApplyEntry::SwitchWal { lsn: switch_lsn } = &entries[2] else {
            panic!("expected a wal switch");
        };
        assert_eq!(u64::from(*switch_lsn), 0x2000000);
    }

    #[test]
    fn statements_outside_transactions_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.sql");
        fs::write(&path, "INSERT INTO t VALUES (1);\n").unwrap();

        let err = parse_sql_file(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidCdcMessage);
    }

    #[test]
    fn crash_replay_is_exactly_once_per_transaction() {
        // After applying up to 0/1000, a restart must skip the first
        // transaction and replay the second.
        let progress = Some(lsn(0x1000));
        assert!(already_applied(lsn(0x1000), progress));
        assert!(!already_applied(lsn(0x2000), progress));
    }
}
