use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Subcommand};
use pgclone::cdc::{
    self, OutputPlugin, StreamSpecs,
    apply::{ApplyMode, stream_apply},
    receive::stream_receive,
    sentinel,
    transform::{transform_file, transform_worker},
};
use pgclone::concurrency::queue::bounded;
use pgclone::pgsql::{ConnKind, PgConnection, parse_lsn};
use pgclone::supervisor::Supervisor;
use pgclone::workdir::CopyFilePaths;
use pgclone_config::{DEFAULT_ORIGIN, DEFAULT_PLUGIN, DEFAULT_SLOT_NAME};

use crate::commands::ConnectionArgs;

#[derive(Debug, Args)]
pub struct StreamArgs {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Replication slot to stream from
    #[arg(long, default_value = DEFAULT_SLOT_NAME)]
    pub slot_name: String,

    /// Replication origin name on the target
    #[arg(long, default_value = DEFAULT_ORIGIN)]
    pub origin: String,

    /// Logical decoding output plugin
    #[arg(long, default_value = DEFAULT_PLUGIN)]
    pub plugin: String,

    /// Stop once this LSN has been replayed
    #[arg(long)]
    pub endpos: Option<String>,
}

impl StreamArgs {
    fn specs(&self) -> Result<StreamSpecs> {
        let paths = CopyFilePaths::compute(self.connection.dir.as_deref(), false)?;
        std::fs::create_dir_all(&paths.cdc.dir)?;
        Ok(StreamSpecs {
            paths: paths.cdc,
            source_pguri: self.connection.source.clone(),
            target_pguri: self.connection.target.clone(),
            plugin: OutputPlugin::from_name(&self.plugin)?,
            slot_name: self.slot_name.clone(),
            origin: self.origin.clone(),
            endpos: self.endpos.as_deref().map(parse_lsn).transpose()?,
        })
    }
}

#[derive(Debug, Subcommand)]
pub enum StreamCommand {
    /// Create the replication slot, origin and sentinel
    Setup(StreamArgs),
    /// Drop the replication slot, origin and sentinel
    Cleanup(StreamArgs),
    /// Stream logical decoding messages into JSON files
    Receive(StreamArgs),
    /// Receive and transform, without applying
    Prefetch(StreamArgs),
    /// Transform one JSON file into its SQL file
    Transform {
        /// The JSON-lines file to transform
        json_file: PathBuf,
    },
    /// Replay the SQL files that are already on disk, then stop
    Apply(StreamArgs),
    /// Alias of apply: catch up with what receive has fetched
    Catchup(StreamArgs),
    /// Keep replaying as receive produces more files
    Replay(StreamArgs),
    /// Inspect or update the sentinel
    #[command(subcommand)]
    Sentinel(SentinelCommand),
}

#[derive(Debug, Subcommand)]
pub enum SentinelCommand {
    /// Print the sentinel record
    Get(StreamArgs),
    /// Enable or disable apply
    SetApply {
        #[command(flatten)]
        args: StreamArgs,
        /// true to enable, false to disable
        #[arg(default_value_t = true)]
        enabled: bool,
    },
    /// Publish the position apply must stop at
    SetEndpos {
        #[command(flatten)]
        args: StreamArgs,
        /// LSN in X/Y notation; defaults to the source's current position
        lsn: Option<String>,
    },
}

pub async fn run(command: StreamCommand) -> Result<()> {
    match command {
        StreamCommand::Setup(args) => {
            let specs = args.specs()?;
            let start_lsn = cdc::stream_setup(&specs).await?;
            println!("{start_lsn}");
            Ok(())
        }
        StreamCommand::Cleanup(args) => {
            let specs = args.specs()?;
            cdc::stream_cleanup(&specs).await?;
            Ok(())
        }
        StreamCommand::Receive(args) | StreamCommand::Prefetch(args) => {
            let specs = args.specs()?;
            let mut supervisor = Supervisor::new();
            supervisor.listen_for_signals()?;

            let (transform_tx, transform_rx) = bounded(16);
            let transform = tokio::spawn(transform_worker(transform_rx));

            let result = stream_receive(specs, transform_tx, supervisor.subscribe()).await;
            transform.await??;
            result?;
            Ok(())
        }
        StreamCommand::Transform { json_file } => {
            let sql_file = json_file.with_extension("sql");
            let mut carry = None;
            let counters = transform_file(&json_file, &sql_file, &mut carry)?;
            println!(
                "{}: {} messages, {} transactions",
                sql_file.display(),
                counters.total,
                counters.commit
            );
            Ok(())
        }
        StreamCommand::Apply(args) | StreamCommand::Catchup(args) => {
            run_apply(args, ApplyMode::Catchup).await
        }
        StreamCommand::Replay(args) => run_apply(args, ApplyMode::Replay).await,
        StreamCommand::Sentinel(command) => run_sentinel(command).await,
    }
}

async fn run_apply(args: StreamArgs, mode: ApplyMode) -> Result<()> {
    let specs = args.specs()?;
    let mut supervisor = Supervisor::new();
    supervisor.listen_for_signals()?;

    let outcome = stream_apply(specs, mode, supervisor.subscribe()).await?;
    println!(
        "replayed up to {}{}",
        outcome.replay_lsn,
        if outcome.reached_endpos {
            ", end position reached"
        } else {
            ""
        }
    );
    Ok(())
}

async fn run_sentinel(command: SentinelCommand) -> Result<()> {
    match command {
        SentinelCommand::Get(args) => {
            let source = PgConnection::connect(&args.connection.source, ConnKind::Source).await?;
            let record = sentinel::fetch_sentinel(&source).await?;
            println!("{record}");
        }
        SentinelCommand::SetApply { args, enabled } => {
            let source = PgConnection::connect(&args.connection.source, ConnKind::Source).await?;
            sentinel::set_apply(&source, enabled).await?;
        }
        SentinelCommand::SetEndpos { args, lsn } => {
            let source = PgConnection::connect(&args.connection.source, ConnKind::Source).await?;
            let endpos = match lsn {
                Some(lsn) => parse_lsn(&lsn)?,
                None => {
                    let row = source
                        .query_one("SELECT pg_catalog.pg_current_wal_lsn()", &[])
                        .await?;
                    row.get(0)
                }
            };
            sentinel::set_endpos(&source, endpos).await?;
            println!("{endpos}");
        }
    }
    Ok(())
}
