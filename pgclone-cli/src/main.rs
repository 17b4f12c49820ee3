//! pgclone command-line binary.
//!
//! Parses the verb tree, initializes tracing, starts the async runtime and
//! hands off to the library. Exit code is zero on success, non-zero when any
//! part of the run failed.

mod commands;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};

use crate::commands::clone::CloneArgs;
use crate::commands::copy::CopyCommand;
use crate::commands::list::ListCommand;
use crate::commands::schema::{DumpCommand, RestoreCommand};
use crate::commands::stream::StreamCommand;

#[derive(Parser)]
#[command(name = "pgclone", version, about = "Clone a Postgres database, fast")]
struct Cli {
    /// Increase logging verbosity (-v, -vv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Copy a whole database from the source to the target instance
    Clone(CloneArgs),
    /// List objects of the source database
    #[command(subcommand)]
    List(ListCommand),
    /// Dump the source schema with pg_dump
    #[command(subcommand)]
    Dump(DumpCommand),
    /// Restore dumped schema sections on the target
    #[command(subcommand)]
    Restore(RestoreCommand),
    /// Run a single phase of the copy
    #[command(subcommand)]
    Copy(CopyCommand),
    /// Change data capture: follow the source WAL onto the target
    #[command(subcommand)]
    Stream(StreamCommand),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    pgclone_telemetry::init_tracing(cli.verbose);

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Clone(args) => commands::clone::run(args).await,
        Command::List(command) => commands::list::run(command).await,
        Command::Dump(command) => commands::schema::run_dump(command).await,
        Command::Restore(command) => commands::schema::run_restore(command).await,
        Command::Copy(command) => commands::copy::run(command).await,
        Command::Stream(command) => commands::stream::run(command).await,
    }
}
