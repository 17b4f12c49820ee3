//! Shared configuration types for pgclone.
//!
//! Holds everything both the library and the command-line binary need to agree
//! on: connection-time Postgres settings, environment variable names, and the
//! human-friendly byte-size format used by `--split-tables-larger-than`.

mod connection;
mod size;

pub use connection::{PgConnectionOptions, SOURCE_CONNECTION_OPTIONS, TARGET_CONNECTION_OPTIONS, scrub_pguri};
pub use size::{ByteSize, ParseSizeError};

/// Environment variable read when `--source` is not given.
pub const ENV_SOURCE_PGURI: &str = "PGCLONE_SOURCE_PGURI";
/// Environment variable read when `--target` is not given.
pub const ENV_TARGET_PGURI: &str = "PGCLONE_TARGET_PGURI";
/// Environment variable read when `--table-jobs` is not given.
pub const ENV_TABLE_JOBS: &str = "PGCLONE_TABLE_JOBS";
/// Environment variable read when `--index-jobs` is not given.
pub const ENV_INDEX_JOBS: &str = "PGCLONE_INDEX_JOBS";
/// Environment variable read when `--snapshot` is not given.
pub const ENV_SNAPSHOT: &str = "PGCLONE_SNAPSHOT";
/// Environment variable read when `--split-tables-larger-than` is not given.
pub const ENV_SPLIT_TABLES_LARGER_THAN: &str = "PGCLONE_SPLIT_TABLES_LARGER_THAN";

/// Default worker count for table COPY jobs.
pub const DEFAULT_TABLE_JOBS: usize = 4;
/// Default worker count for CREATE INDEX jobs.
pub const DEFAULT_INDEX_JOBS: usize = 4;

/// Default logical decoding output plugin.
pub const DEFAULT_PLUGIN: &str = "test_decoding";
/// Default replication slot name.
pub const DEFAULT_SLOT_NAME: &str = "pgclone";
/// Default replication origin name registered on the target.
pub const DEFAULT_ORIGIN: &str = "pgclone";
