//! Wrappers around the Postgres client tools.
//!
//! Schema dump and restore are delegated to `pg_dump`, `pg_restore` and
//! `pg_dumpall`, which pgclone drives as subprocesses. The processes are
//! killed when their handle is dropped, so a shutdown mid-dump does not leave
//! orphans behind.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{ErrorKind, Result};
use crate::pgclone_error;
use crate::pgsql::PgConnection;

/// Which archive section a dump or restore covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaSection {
    PreData,
    PostData,
}

impl SchemaSection {
    pub fn as_flag(self) -> &'static str {
        match self {
            SchemaSection::PreData => "pre-data",
            SchemaSection::PostData => "post-data",
        }
    }
}

async fn run_tool(kind: ErrorKind, mut command: Command) -> Result<()> {
    let rendered = format!("{:?}", command.as_std());
    debug!(command = %rendered, "running postgres tool");

    let output = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|err| {
            pgclone_error!(
                kind,
                "failed to run postgres client tool, is it installed?",
                format!("{rendered}: {err}")
            )
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(pgclone_error!(
            kind,
            "postgres client tool failed",
            format!("{rendered} exited with {}: {}", output.status, stderr.trim())
        ));
    }

    Ok(())
}

/// Dumps one schema section of the source database to a custom-format
/// archive, bounded by the shared snapshot when one is held.
pub async fn pg_dump_section(
    source_pguri: &str,
    section: SchemaSection,
    snapshot: Option<&str>,
    output: &Path,
) -> Result<()> {
    info!(section = section.as_flag(), file = %output.display(), "dumping schema section");

    let mut command = Command::new("pg_dump");
    command
        .arg("--format=custom")
        .arg(format!("--section={}", section.as_flag()))
        .arg("--file")
        .arg(output);
    if let Some(snapshot) = snapshot {
        command.arg(format!("--snapshot={snapshot}"));
    }
    command.arg(source_pguri);

    run_tool(ErrorKind::DumpFailed, command).await
}

/// Restores a dumped archive section on the target database.
pub async fn pg_restore_section(
    target_pguri: &str,
    dump_file: &Path,
    list_file: Option<&Path>,
) -> Result<()> {
    info!(file = %dump_file.display(), "restoring schema section");

    let mut command = Command::new("pg_restore");
    command
        .arg("--dbname")
        .arg(target_pguri)
        .arg("--no-owner")
        .arg("--exit-on-error");
    if let Some(list_file) = list_file {
        command.arg("--use-list").arg(list_file);
    }
    command.arg(dump_file);

    run_tool(ErrorKind::RestoreFailed, command).await
}

/// Writes the archive table of contents of a dump to the given list file,
/// so that a user can edit it and restore with `--use-list`.
pub async fn pg_restore_list(dump_file: &Path, list_file: &Path) -> Result<()> {
    let output = Command::new("pg_restore")
        .arg("--list")
        .arg(dump_file)
        .stdin(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|err| {
            pgclone_error!(
                ErrorKind::RestoreFailed,
                "failed to run pg_restore --list",
                err
            )
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(pgclone_error!(
            ErrorKind::RestoreFailed,
            "pg_restore --list failed",
            stderr.trim()
        ));
    }

    tokio::fs::write(list_file, &output.stdout).await?;
    Ok(())
}

/// Dumps the roles of the source instance as plain SQL.
pub async fn pg_dumpall_roles(source_pguri: &str, output: &Path) -> Result<()> {
    info!(file = %output.display(), "dumping roles");

    let mut command = Command::new("pg_dumpall");
    command
        .arg("--roles-only")
        .arg("--no-role-passwords")
        .arg("--file")
        .arg(output)
        .arg("--dbname")
        .arg(source_pguri);

    run_tool(ErrorKind::DumpFailed, command).await
}

/// Applies a plain SQL file on the target, skipping comments and psql
/// directives. Used for the roles dump.
pub async fn apply_sql_file(target: &PgConnection, path: &Path) -> Result<()> {
    let contents = tokio::fs::read_to_string(path).await?;
    let sql: String = contents
        .lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            !trimmed.starts_with("--") && !trimmed.starts_with('\\')
        })
        .collect::<Vec<_>>()
        .join("\n");

    if sql.trim().is_empty() {
        return Ok(());
    }

    target.simple_query(&sql).await?;
    Ok(())
}
