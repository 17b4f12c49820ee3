//! pgclone core library.
//!
//! Copies a whole database between two Postgres instances through a
//! resumable, parallel pipeline, and optionally follows the source's WAL
//! with logical decoding to replay ongoing changes on the target.

pub mod catalog;
pub mod cdc;
pub mod concurrency;
pub mod error;
pub mod macros;
pub mod orchestrator;
pub mod pgcmd;
pub mod pgsql;
pub mod report;
pub mod snapshot;
pub mod summary;
pub mod supervisor;
pub mod workdir;
pub mod workers;

pub use tokio_postgres::types::PgLsn;
