use anyhow::Result;
use clap::{ArgAction, Args};
use pgclone::cdc::{self, OutputPlugin, StreamSpecs, sentinel};
use pgclone::orchestrator::{CopyOrchestrator, CopyPlan, Section};
use pgclone::pgsql::{ConnKind, PgConnection, parse_lsn};
use pgclone::supervisor::Supervisor;
use pgclone::workdir::CopyFilePaths;
use pgclone_config::{
    ByteSize, DEFAULT_INDEX_JOBS, DEFAULT_ORIGIN, DEFAULT_PLUGIN, DEFAULT_SLOT_NAME,
    DEFAULT_TABLE_JOBS, ENV_INDEX_JOBS, ENV_SNAPSHOT, ENV_SPLIT_TABLES_LARGER_THAN,
    ENV_TABLE_JOBS,
};
use tracing::info;

use crate::commands::ConnectionArgs;

#[derive(Debug, Args)]
pub struct CloneArgs {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Number of concurrent table COPY jobs
    #[arg(long, env = ENV_TABLE_JOBS, default_value_t = DEFAULT_TABLE_JOBS)]
    pub table_jobs: usize,

    /// Number of concurrent CREATE INDEX jobs
    #[arg(long, env = ENV_INDEX_JOBS, default_value_t = DEFAULT_INDEX_JOBS)]
    pub index_jobs: usize,

    /// Partition the COPY of tables larger than this size (e.g. 10GB)
    #[arg(long, env = ENV_SPLIT_TABLES_LARGER_THAN)]
    pub split_tables_larger_than: Option<ByteSize>,

    /// Re-use an already exported snapshot instead of exporting one
    #[arg(long, env = ENV_SNAPSHOT)]
    pub snapshot: Option<String>,

    /// Remove a previous work directory and start over
    #[arg(long)]
    pub restart: bool,

    /// Continue from where an interrupted run stopped
    #[arg(long)]
    pub resume: bool,

    /// Run without a consistent snapshot
    #[arg(long = "not-consistent")]
    pub not_consistent: bool,

    /// Do not copy large objects
    #[arg(long)]
    pub skip_large_objects: bool,

    /// Do not create extensions on the target
    #[arg(long)]
    pub skip_extensions: bool,

    /// Also copy roles with pg_dumpall --roles-only
    #[arg(long)]
    pub roles: bool,

    /// Abort the whole run on the first error
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub fail_fast: bool,

    /// After the copy, keep following the source WAL onto the target
    #[arg(long)]
    pub follow: bool,

    /// Replication slot to create and stream from (with --follow)
    #[arg(long, default_value = DEFAULT_SLOT_NAME)]
    pub slot_name: String,

    /// Replication origin name on the target (with --follow)
    #[arg(long, default_value = DEFAULT_ORIGIN)]
    pub origin: String,

    /// Logical decoding output plugin (with --follow)
    #[arg(long, default_value = DEFAULT_PLUGIN)]
    pub plugin: String,

    /// Stop following once this LSN has been replayed (with --follow)
    #[arg(long)]
    pub endpos: Option<String>,
}

impl CloneArgs {
    pub fn to_plan(&self, section: Section) -> CopyPlan {
        CopyPlan {
            source_pguri: self.connection.source.clone(),
            target_pguri: self.connection.target.clone(),
            dir: self.connection.dir.clone(),
            table_jobs: self.table_jobs,
            index_jobs: self.index_jobs,
            // Vacuum shares the table job count, there is no separate knob.
            vacuum_jobs: self.table_jobs,
            split_threshold: self.split_tables_larger_than.clone().unwrap_or_default(),
            section,
            snapshot: self.snapshot.clone(),
            restart: self.restart,
            resume: self.resume,
            consistent: !self.not_consistent,
            skip_large_objects: self.skip_large_objects,
            skip_extensions: self.skip_extensions,
            roles: self.roles,
            fail_fast: self.fail_fast,
        }
    }

    fn stream_specs(&self) -> Result<StreamSpecs> {
        let paths = CopyFilePaths::compute(self.connection.dir.as_deref(), false)?;
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

pub async fn run(args: CloneArgs) -> Result<()> {
    // In follow mode the slot, origin and sentinel exist before the copy
    // starts, so changes made during the copy are retained for replay.
    let specs = if args.follow {
        let specs = args.stream_specs()?;
        cdc::stream_setup(&specs).await?;
        Some(specs)
    } else {
        None
    };

    let summary = CopyOrchestrator::new(args.to_plan(Section::All))?.run().await?;
    print!("{}", summary.render());

    let Some(specs) = specs else {
        return Ok(());
    };

    // The target now holds a faithful snapshot: enable apply and follow.
    let source = PgConnection::connect(&specs.source_pguri, ConnKind::Source).await?;
    sentinel::set_apply(&source, true).await?;
    drop(source);

    info!("base copy complete, following the source WAL");

    let mut supervisor = Supervisor::new();
    supervisor.listen_for_signals()?;
    cdc::follow(specs, supervisor.subscribe()).await?;

    Ok(())
}
