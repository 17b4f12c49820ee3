use anyhow::Result;
use clap::{Args, Subcommand};
use pgclone::catalog::SourceCatalog;
use pgclone::pgsql::{ConnKind, PgConnection};
use pgclone_config::ENV_SOURCE_PGURI;

#[derive(Debug, Args)]
pub struct ListArgs {
    /// Source database connection string
    #[arg(long, env = ENV_SOURCE_PGURI)]
    pub source: String,

    /// Print the raw JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum ListCommand {
    /// Ordinary tables with their on-disk sizes
    Tables(ListArgs),
    /// Indexes and their backing constraints
    Indexes(ListArgs),
    /// Sequences and their current values
    Sequences(ListArgs),
    /// Installed extensions
    Extensions(ListArgs),
    /// The whole catalog, as stored in schema.json
    Schema(ListArgs),
}

pub async fn run(command: ListCommand) -> Result<()> {
    let (args, what) = match &command {
        ListCommand::Tables(args) => (args, "tables"),
        ListCommand::Indexes(args) => (args, "indexes"),
        ListCommand::Sequences(args) => (args, "sequences"),
        ListCommand::Extensions(args) => (args, "extensions"),
        ListCommand::Schema(args) => (args, "schema"),
    };

    let source = PgConnection::connect(&args.source, ConnKind::Source).await?;
    let catalog = SourceCatalog::fetch(&source, 0).await?;

    match what {
        "tables" => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(&catalog.tables)?);
                return Ok(());
            }
            println!("{:>10} | {:<40} | {:>12} | {:>12}", "OID", "Name", "Est. rows", "Size");
            for table in &catalog.tables {
                println!(
                    "{:>10} | {:<40} | {:>12} | {:>12}",
                    table.oid,
                    format!("{}.{}", table.nspname, table.relname),
                    table.reltuples,
                    table.bytes_pretty
                );
            }
        }
        "indexes" => {
            let indexes: Vec<_> = catalog
                .tables
                .iter()
                .flat_map(|table| table.indexes.iter())
                .collect();
            if args.json {
                println!("{}", serde_json::to_string_pretty(&indexes)?);
                return Ok(());
            }
            println!("{:>10} | {:<40} | {:<40}", "OID", "Name", "Constraint");
            for index in indexes {
                println!(
                    "{:>10} | {:<40} | {:<40}",
                    index.index_oid,
                    format!("{}.{}", index.nspname, index.relname),
                    index.constraint_name
                );
            }
        }
        "sequences" => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(&catalog.sequences)?);
                return Ok(());
            }
            println!("{:>10} | {:<40} | {:>14} | {:<9}", "OID", "Name", "Last value", "Called");
            for sequence in &catalog.sequences {
                println!(
                    "{:>10} | {:<40} | {:>14} | {:<9}",
                    sequence.oid,
                    format!("{}.{}", sequence.nspname, sequence.relname),
                    sequence.last_value,
                    sequence.is_called
                );
            }
        }
        "extensions" => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(&catalog.extensions)?);
                return Ok(());
            }
            println!("{:>10} | {:<30} | {:>14}", "OID", "Name", "Config tables");
            for extension in &catalog.extensions {
                println!(
                    "{:>10} | {:<30} | {:>14}",
                    extension.oid,
                    extension.name,
                    extension.configs.len()
                );
            }
        }
        _ => {
            println!("{}", serde_json::to_string_pretty(&catalog)?);
        }
    }

    Ok(())
}
