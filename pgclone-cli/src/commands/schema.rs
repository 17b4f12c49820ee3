use anyhow::Result;
use clap::{Args, Subcommand};
use pgclone::pgcmd::{SchemaSection, pg_dump_section, pg_restore_list, pg_restore_section};
use pgclone::workdir::{CopyFilePaths, init_workdir};
use pgclone_config::{ENV_SNAPSHOT, ENV_SOURCE_PGURI, ENV_TARGET_PGURI};

use std::path::PathBuf;

#[derive(Debug, Args)]
pub struct DumpArgs {
    /// Source database connection string
    #[arg(long, env = ENV_SOURCE_PGURI)]
    pub source: String,

    /// Work directory (defaults to $TMPDIR/pgclone)
    #[arg(long)]
    pub dir: Option<PathBuf>,

    /// Re-use an already exported snapshot
    #[arg(long, env = ENV_SNAPSHOT)]
    pub snapshot: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum DumpCommand {
    /// Dump both schema sections
    Schema(DumpArgs),
    /// Dump only the pre-data section
    PreData(DumpArgs),
    /// Dump only the post-data section
    PostData(DumpArgs),
}

pub async fn run_dump(command: DumpCommand) -> Result<()> {
    let (args, sections): (&DumpArgs, &[SchemaSection]) = match &command {
        DumpCommand::Schema(args) => (args, &[SchemaSection::PreData, SchemaSection::PostData]),
        DumpCommand::PreData(args) => (args, &[SchemaSection::PreData]),
        DumpCommand::PostData(args) => (args, &[SchemaSection::PostData]),
    };

    let paths = CopyFilePaths::compute(args.dir.as_deref(), false)?;
    init_workdir(&paths, false, true)?;

    for section in sections {
        let output = match section {
            SchemaSection::PreData => &paths.dumps.pre_data,
            SchemaSection::PostData => &paths.dumps.post_data,
        };
        pg_dump_section(&args.source, *section, args.snapshot.as_deref(), output).await?;
    }

    Ok(())
}

#[derive(Debug, Args)]
pub struct RestoreArgs {
    /// Target database connection string
    #[arg(long, env = ENV_TARGET_PGURI)]
    pub target: String,

    /// Work directory (defaults to $TMPDIR/pgclone)
    #[arg(long)]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum RestoreCommand {
    /// Restore both schema sections
    Schema(RestoreArgs),
    /// Restore only the pre-data section
    PreData(RestoreArgs),
    /// Restore only the post-data section
    PostData(RestoreArgs),
    /// Write the archive tables of contents next to the dumps
    ParseList(RestoreArgs),
}

pub async fn run_restore(command: RestoreCommand) -> Result<()> {
    let (args, sections): (&RestoreArgs, &[SchemaSection]) = match &command {
        RestoreCommand::Schema(args) => {
            (args, &[SchemaSection::PreData, SchemaSection::PostData])
        }
        RestoreCommand::PreData(args) => (args, &[SchemaSection::PreData]),
        RestoreCommand::PostData(args) => (args, &[SchemaSection::PostData]),
        RestoreCommand::ParseList(args) => (args, &[]),
    };

    let paths = CopyFilePaths::compute(args.dir.as_deref(), false)?;

    if let RestoreCommand::ParseList(_) = &command {
        pg_restore_list(&paths.dumps.pre_data, &paths.dumps.pre_list).await?;
        pg_restore_list(&paths.dumps.post_data, &paths.dumps.post_list).await?;
        println!("{}", paths.dumps.pre_list.display());
        println!("{}", paths.dumps.post_list.display());
        return Ok(());
    }

    for section in sections {
        let dump_file = match section {
            SchemaSection::PreData => &paths.dumps.pre_data,
            SchemaSection::PostData => &paths.dumps.post_data,
        };
        pg_restore_section(&args.target, dump_file, None).await?;
    }

    Ok(())
}
