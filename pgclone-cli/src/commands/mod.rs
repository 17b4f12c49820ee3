pub mod clone;
pub mod copy;
pub mod list;
pub mod schema;
pub mod stream;

use std::path::PathBuf;

use clap::Args;
use pgclone_config::{ENV_SOURCE_PGURI, ENV_TARGET_PGURI};

/// Connection and work-directory options shared by most verbs.
#[derive(Debug, Args)]
pub struct ConnectionArgs {
    /// Source database connection string
    #[arg(long, env = ENV_SOURCE_PGURI)]
    pub source: String,

    /// Target database connection string
    #[arg(long, env = ENV_TARGET_PGURI)]
    pub target: String,

    /// Work directory (defaults to $TMPDIR/pgclone)
    #[arg(long)]
    pub dir: Option<PathBuf>,
}
