use anyhow::Result;
use clap::Subcommand;
use pgclone::orchestrator::{CopyOrchestrator, Section};

use crate::commands::clone::CloneArgs;

#[derive(Debug, Subcommand)]
pub enum CopyCommand {
    /// Copy table data, large objects, indexes, constraints and sequences
    Data(CloneArgs),
    /// Copy only the table data
    TableData(CloneArgs),
    /// Copy only the large objects
    Blobs(CloneArgs),
    /// Reset only the sequence values
    Sequences(CloneArgs),
    /// Build only the indexes
    Indexes(CloneArgs),
    /// Install only the constraints
    Constraints(CloneArgs),
}

pub async fn run(command: CopyCommand) -> Result<()> {
    let (args, section) = match &command {
        CopyCommand::Data(args) => (args, Section::All),
        CopyCommand::TableData(args) => (args, Section::TableData),
        CopyCommand::Blobs(args) => (args, Section::Blobs),
        CopyCommand::Sequences(args) => (args, Section::Sequences),
        CopyCommand::Indexes(args) => (args, Section::Indexes),
        CopyCommand::Constraints(args) => (args, Section::Constraints),
    };

    let summary = CopyOrchestrator::new(args.to_plan(section))?.run().await?;

    if matches!(section, Section::All | Section::TableData) {
        print!("{}", summary.render());
    }

    Ok(())
}
