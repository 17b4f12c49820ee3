//! Change data capture.
//!
//! Three long-lived roles follow the source's WAL once the base copy exists:
//! receive streams logical decoding messages into JSON-lines files rotated
//! per WAL segment, transform turns those into replayable SQL files, and
//! apply replays the SQL on the target while advancing a replication origin.
//! A sentinel record on the source coordinates the three.

pub mod apply;
pub mod messages;
pub mod receive;
pub mod sentinel;
pub mod test_decoding;
pub mod transform;
pub mod wal2json;

use std::fs;
use std::path::PathBuf;

use tokio_postgres::types::PgLsn;
use tracing::info;

use crate::concurrency::queue::bounded;
use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{Error, ErrorKind, Result};
use crate::pgclone_error;
use crate::pgsql::{ConnKind, PgConnection};
use crate::workdir::CdcPaths;

/// Logical decoding output plugins pgclone understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputPlugin {
    TestDecoding,
    Wal2Json,
}

impl OutputPlugin {
    pub fn name(self) -> &'static str {
        match self {
            OutputPlugin::TestDecoding => "test_decoding",
            OutputPlugin::Wal2Json => "wal2json",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "test_decoding" => Ok(OutputPlugin::TestDecoding),
            "wal2json" => Ok(OutputPlugin::Wal2Json),
            other => Err(pgclone_error!(
                ErrorKind::Configuration,
                "unknown logical decoding plugin",
                format!("{other:?}, expected test_decoding or wal2json")
            )),
        }
    }

    /// The options clause for START_REPLICATION, asking the plugin for
    /// everything the transform step needs to rebuild transactions.
    pub fn start_options(self) -> &'static str {
        match self {
            OutputPlugin::TestDecoding => {
                "(\"include-xids\" '1', \"include-timestamp\" '1', \"skip-empty-xacts\" '1')"
            }
            OutputPlugin::Wal2Json => {
                "(\"format-version\" '2', \"include-xids\" 'true', \
                  \"include-lsn\" 'true', \"include-timestamp\" 'true')"
            }
        }
    }
}

/// Timeline and WAL segment size of the source, learned from
/// IDENTIFY_SYSTEM and persisted in the cdc directory so a resumed stream
/// can verify it still talks to the same server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDbContext {
    pub timeline: u32,
    pub wal_segment_size: u64,
}

impl StreamDbContext {
    pub fn write(&self, paths: &CdcPaths) -> Result<()> {
        fs::write(&paths.tli_file, format!("{}\n", self.timeline))?;
        fs::write(
            &paths.wal_segment_size_file,
            format!("{}\n", self.wal_segment_size),
        )?;
        Ok(())
    }

    pub fn read(paths: &CdcPaths) -> Result<Option<Self>> {
        if !paths.tli_file.exists() || !paths.wal_segment_size_file.exists() {
            return Ok(None);
        }

        let timeline = fs::read_to_string(&paths.tli_file)?;
        let wal_segment_size = fs::read_to_string(&paths.wal_segment_size_file)?;

        let parse = |value: &str, what: &'static str| -> Result<u64> {
            value
                .trim()
                .parse()
                .map_err(|_| pgclone_error!(ErrorKind::SummaryCorrupted, what, format!("{value:?}")))
        };

        Ok(Some(StreamDbContext {
            timeline: parse(&timeline, "invalid timeline file")? as u32,
            wal_segment_size: parse(&wal_segment_size, "invalid wal segment size file")?,
        }))
    }

    /// A resumed stream must still match the persisted context; a changed
    /// timeline or segment size means the files on disk belong to another
    /// server lifetime.
    pub fn verify_against(&self, paths: &CdcPaths) -> Result<()> {
        if let Some(previous) = Self::read(paths)?
            && previous != *self
        {
            return Err(pgclone_error!(
                ErrorKind::WorkDirState,
                "cdc files belong to a different source timeline",
                format!("on disk {previous:?}, server reports {self:?}")
            ));
        }
        self.write(paths)
    }
}

/// The WAL file name holding the given position, as the server spells it.
pub fn wal_file_name(timeline: u32, lsn: PgLsn, wal_segment_size: u64) -> String {
    let segment_number = u64::from(lsn) / wal_segment_size;
    let segments_per_xlogid = 0x1_0000_0000 / wal_segment_size;
    format!(
        "{timeline:08X}{:08X}{:08X}",
        segment_number / segments_per_xlogid,
        segment_number % segments_per_xlogid
    )
}

/// First LSN of the segment containing the given position.
pub fn segment_start(lsn: PgLsn, wal_segment_size: u64) -> PgLsn {
    PgLsn::from(u64::from(lsn) - u64::from(lsn) % wal_segment_size)
}

/// Path of the JSON-lines file for the segment at the given position.
pub fn json_file_path(paths: &CdcPaths, context: &StreamDbContext, lsn: PgLsn) -> PathBuf {
    paths
        .dir
        .join(format!("{}.json", wal_file_name(context.timeline, lsn, context.wal_segment_size)))
}

/// Path of the SQL file transform derives from a segment's JSON file.
pub fn sql_file_path(paths: &CdcPaths, context: &StreamDbContext, lsn: PgLsn) -> PathBuf {
    paths
        .dir
        .join(format!("{}.sql", wal_file_name(context.timeline, lsn, context.wal_segment_size)))
}

/// Everything the streaming roles need to know.
#[derive(Debug, Clone)]
pub struct StreamSpecs {
    pub paths: CdcPaths,
    pub source_pguri: String,
    pub target_pguri: String,
    pub plugin: OutputPlugin,
    pub slot_name: String,
    pub origin: String,
    pub endpos: Option<PgLsn>,
}

/// Prepares both databases for following: creates the replication slot on
/// the source, the replication origin on the target, and the sentinel.
/// Returns the slot's consistent point, the natural start position.
pub async fn stream_setup(specs: &StreamSpecs) -> Result<PgLsn> {
    fs::create_dir_all(&specs.paths.dir)?;

    let source = PgConnection::connect(&specs.source_pguri, ConnKind::Source).await?;

    let row = source
        .query_one(
            "SELECT lsn FROM pg_catalog.pg_create_logical_replication_slot($1, $2)",
            &[&specs.slot_name, &specs.plugin.name()],
        )
        .await
        .map_err(|err| {
            pgclone_error!(
                ErrorKind::ReplicationSlotFailed,
                "failed to create the replication slot",
                format!("{}: {err}", specs.slot_name)
            )
        })?;
    let start_lsn: PgLsn = row.get("lsn");

    info!(slot = %specs.slot_name, lsn = %start_lsn, "created replication slot");

    let target = PgConnection::connect(&specs.target_pguri, ConnKind::Target).await?;
    let exists = target
        .query(
            "SELECT 1 FROM pg_catalog.pg_replication_origin WHERE roname = $1",
            &[&specs.origin],
        )
        .await?;
    if exists.is_empty() {
        target
            .query_one(
                "SELECT pg_catalog.pg_replication_origin_create($1)",
                &[&specs.origin],
            )
            .await
            .map_err(|err| {
                pgclone_error!(
                    ErrorKind::OriginFailed,
                    "failed to create the replication origin",
                    format!("{}: {err}", specs.origin)
                )
            })?;
        info!(origin = %specs.origin, "created replication origin");
    }

    fs::write(&specs.paths.origin_file, format!("{}\n", specs.origin))?;

    sentinel::create_sentinel(&source, start_lsn, specs.endpos).await?;

    Ok(start_lsn)
}

/// Removes what [`stream_setup`] created, for `stream cleanup`.
pub async fn stream_cleanup(specs: &StreamSpecs) -> Result<()> {
    let source = PgConnection::connect(&specs.source_pguri, ConnKind::Source).await?;
    let dropped = source
        .query(
            "SELECT pg_catalog.pg_drop_replication_slot(slot_name) \
               FROM pg_catalog.pg_replication_slots WHERE slot_name = $1",
            &[&specs.slot_name],
        )
        .await?;
    if !dropped.is_empty() {
        info!(slot = %specs.slot_name, "dropped replication slot");
    }

    sentinel::drop_sentinel(&source).await?;

    let target = PgConnection::connect(&specs.target_pguri, ConnKind::Target).await?;
    let dropped = target
        .query(
            "SELECT pg_catalog.pg_replication_origin_drop(roname) \
               FROM pg_catalog.pg_replication_origin WHERE roname = $1",
            &[&specs.origin],
        )
        .await?;
    if !dropped.is_empty() {
        info!(origin = %specs.origin, "dropped replication origin");
    }

    Ok(())
}

/// Follow mode: receive (with its transform worker) and apply run until the
/// end position is reached or a shutdown is requested.
pub async fn follow(specs: StreamSpecs, shutdown: ShutdownRx) -> Result<()> {
    let (transform_tx, transform_rx) = bounded(16);

    let receive_specs = specs.clone();
    let receive_shutdown = shutdown.clone();
    let receive_task = tokio::spawn(async move {
        receive::stream_receive(receive_specs, transform_tx, receive_shutdown).await
    });

    let transform_task =
        tokio::spawn(async move { transform::transform_worker(transform_rx).await });

    let apply_specs = specs.clone();
    let apply_task = tokio::spawn(async move {
        apply::stream_apply(apply_specs, apply::ApplyMode::Replay, shutdown).await
    });

    let mut errors: Vec<Error> = Vec::new();
    let mut collect = |result: std::result::Result<Result<()>, tokio::task::JoinError>| {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) if err.is_shutdown() => {}
            Ok(Err(err)) => errors.push(err),
            Err(join_err) => errors.push(pgclone_error!(
                ErrorKind::WorkerPanic,
                "stream worker panicked",
                join_err
            )),
        }
    };

    collect(receive_task.await);
    collect(transform_task.await);
    collect(apply_task.await.map(|outcome| outcome.map(|_| ())));

    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::from_many(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAL_SEG_SZ: u64 = 16 * 1024 * 1024;

    #[test]
    fn wal_file_names_match_server_spelling() {
        assert_eq!(
            wal_file_name(1, PgLsn::from(0u64), WAL_SEG_SZ),
            "000000010000000000000000"
        );
        // 0/1949710 sits in segment 1 of log 0.
        assert_eq!(
            wal_file_name(1, PgLsn::from(0x1949710u64), WAL_SEG_SZ),
            "000000010000000000000001"
        );
        // 16/B374D848 on timeline 3.
        assert_eq!(
            wal_file_name(3, PgLsn::from((0x16u64 << 32) | 0xB374D848), WAL_SEG_SZ),
            "0000000300000016000000B3"
        );
    }

    #[test]
    fn segment_start_truncates_to_boundary() {
        let lsn = PgLsn::from(0x1949710u64);
        assert_eq!(u64::from(segment_start(lsn, WAL_SEG_SZ)), 0x1000000);

        let boundary = PgLsn::from(0x2000000u64);
        assert_eq!(segment_start(boundary, WAL_SEG_SZ), boundary);
    }

    #[test]
    fn context_round_trips_and_detects_mismatch() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths =
            crate::workdir::CopyFilePaths::compute(Some(dir.path()), false).unwrap();
        fs::create_dir_all(&paths.cdc.dir).unwrap();

        let context = StreamDbContext {
            timeline: 2,
            wal_segment_size: WAL_SEG_SZ,
        };
        assert_eq!(StreamDbContext::read(&paths.cdc).unwrap(), None);
        context.verify_against(&paths.cdc).unwrap();
        assert_eq!(StreamDbContext::read(&paths.cdc).unwrap(), Some(context));

        let other = StreamDbContext {
            timeline: 3,
            wal_segment_size: WAL_SEG_SZ,
        };
        let err = other.verify_against(&paths.cdc).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WorkDirState);
    }

    #[test]
    fn plugin_names_round_trip() {
        assert_eq!(
            OutputPlugin::from_name("wal2json").unwrap(),
            OutputPlugin::Wal2Json
        );
        assert_eq!(OutputPlugin::TestDecoding.name(), "test_decoding");
        assert!(OutputPlugin::from_name("pgoutput").is_err());
    }
}
