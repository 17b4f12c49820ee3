//! The sentinel: a single-row control record on the source database.
//!
//! The three streaming roles coordinate through it: setup writes the start
//! position, the user flips the apply switch and publishes an end position,
//! receive reports how far it has written and flushed, and apply publishes
//! its replay progress. Keeping it on the source makes it reachable from
//! any host running one of the roles.

use std::fmt;

use tokio_postgres::types::PgLsn;
use tracing::info;

use crate::error::{ErrorKind, Result};
use crate::pgclone_error;
use crate::pgsql::PgConnection;

/// The sentinel record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sentinel {
    pub startpos: PgLsn,
    /// Apply stops once a commit at or past this position was replayed.
    pub endpos: Option<PgLsn>,
    pub apply_enabled: bool,
    pub write_lsn: PgLsn,
    pub flush_lsn: PgLsn,
    pub replay_lsn: PgLsn,
}

impl fmt::Display for Sentinel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "startpos {}", self.startpos)?;
        match self.endpos {
            Some(endpos) => writeln!(f, "endpos   {endpos}")?,
            None => writeln!(f, "endpos   (none)")?,
        }
        writeln!(f, "apply    {}", if self.apply_enabled { "enabled" } else { "disabled" })?;
        writeln!(f, "write    {}", self.write_lsn)?;
        writeln!(f, "flush    {}", self.flush_lsn)?;
        write!(f, "replay   {}", self.replay_lsn)
    }
}

/// Creates the sentinel, replacing any record from a previous setup.
pub async fn create_sentinel(
    source: &PgConnection,
    startpos: PgLsn,
    endpos: Option<PgLsn>,
) -> Result<()> {
    source
        .simple_query(
            "CREATE SCHEMA IF NOT EXISTS pgclone; \
             CREATE TABLE IF NOT EXISTS pgclone.sentinel ( \
                 id integer PRIMARY KEY CHECK (id = 1), \
                 startpos pg_lsn NOT NULL, \
                 endpos pg_lsn, \
                 apply boolean NOT NULL DEFAULT false, \
                 write_lsn pg_lsn NOT NULL DEFAULT '0/0', \
                 flush_lsn pg_lsn NOT NULL DEFAULT '0/0', \
                 replay_lsn pg_lsn NOT NULL DEFAULT '0/0')",
        )
        .await?;

    source
        .query(
            "INSERT INTO pgclone.sentinel (id, startpos, endpos) \
             VALUES (1, $1, $2) \
             ON CONFLICT (id) DO UPDATE \
                SET startpos = excluded.startpos, \
                    endpos = excluded.endpos, \
                    apply = false, \
                    write_lsn = '0/0', \
                    flush_lsn = '0/0', \
                    replay_lsn = '0/0'",
            &[&startpos, &endpos],
        )
        .await?;

    info!(startpos = %startpos, "created sentinel");
    Ok(())
}

/// Reads the sentinel; missing table or row reports a dedicated error so
/// callers can suggest running `stream setup`.
pub async fn fetch_sentinel(source: &PgConnection) -> Result<Sentinel> {
    let rows = source
        .query(
            "SELECT startpos, endpos, apply, write_lsn, flush_lsn, replay_lsn \
               FROM pgclone.sentinel WHERE id = 1",
            &[],
        )
        .await
        .map_err(|_| sentinel_missing())?;

    let row = rows.first().ok_or_else(sentinel_missing)?;

    Ok(Sentinel {
        startpos: row.get("startpos"),
        endpos: row.get("endpos"),
        apply_enabled: row.get("apply"),
        write_lsn: row.get("write_lsn"),
        flush_lsn: row.get("flush_lsn"),
        replay_lsn: row.get("replay_lsn"),
    })
}

fn sentinel_missing() -> crate::error::Error {
    pgclone_error!(
        ErrorKind::SentinelMissing,
        "no sentinel found on the source database",
        "run `pgclone stream setup` first"
    )
}

/// Enables or disables apply.
pub async fn set_apply(source: &PgConnection, enabled: bool) -> Result<()> {
    source
        .query(
            "UPDATE pgclone.sentinel SET apply = $1 WHERE id = 1",
            &[&enabled],
        )
        .await?;
    info!(enabled, "updated sentinel apply switch");
    Ok(())
}

/// Publishes the position apply must stop at.
pub async fn set_endpos(source: &PgConnection, endpos: PgLsn) -> Result<()> {
    source
        .query(
            "UPDATE pgclone.sentinel SET endpos = $1 WHERE id = 1",
            &[&endpos],
        )
        .await?;
    info!(endpos = %endpos, "updated sentinel end position");
    Ok(())
}

/// Receive-side progress: last position written to a JSON file and last
/// position known flushed.
pub async fn update_written(
    source: &PgConnection,
    write_lsn: PgLsn,
    flush_lsn: PgLsn,
) -> Result<()> {
    source
        .query(
            "UPDATE pgclone.sentinel SET write_lsn = $1, flush_lsn = $2 WHERE id = 1",
            &[&write_lsn, &flush_lsn],
        )
        .await?;
    Ok(())
}

/// Apply-side progress: last commit replayed on the target.
pub async fn update_replay(source: &PgConnection, replay_lsn: PgLsn) -> Result<()> {
    source
        .query(
            "UPDATE pgclone.sentinel SET replay_lsn = $1 WHERE id = 1",
            &[&replay_lsn],
        )
        .await?;
    Ok(())
}

/// Removes the sentinel and its schema, for `stream cleanup`.
pub async fn drop_sentinel(source: &PgConnection) -> Result<()> {
    source
        .simple_query("DROP SCHEMA IF EXISTS pgclone CASCADE")
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_renders_lsns_in_wal_notation() {
        let sentinel = Sentinel {
            startpos: PgLsn::from(0x1949710u64),
            endpos: Some(PgLsn::from(0x2000000u64)),
            apply_enabled: true,
            write_lsn: PgLsn::from(0u64),
            flush_lsn: PgLsn::from(0u64),
            replay_lsn: PgLsn::from(0x1949CC8u64),
        };

        let rendered = sentinel.to_string();
        assert!(rendered.contains("startpos 0/1949710"));
        assert!(rendered.contains("endpos   0/2000000"));
        assert!(rendered.contains("apply    enabled"));
        assert!(rendered.contains("replay   0/1949CC8"));
    }

    #[test]
    fn missing_endpos_renders_as_none() {
        let sentinel = Sentinel {
            startpos: PgLsn::from(0u64),
            endpos: None,
            apply_enabled: false,
            write_lsn: PgLsn::from(0u64),
            flush_lsn: PgLsn::from(0u64),
            replay_lsn: PgLsn::from(0u64),
        };
        assert!(sentinel.to_string().contains("endpos   (none)"));
    }
}
