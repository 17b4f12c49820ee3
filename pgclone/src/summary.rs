//! Per-artifact progress records.
//!
//! A summary file doubles as a lock file while a step runs and as a done file
//! once it finished: identification up front, then timing, then the SQL
//! command that was issued. The format is strictly positional, newline
//! separated, so that any other process (or a human with `cat`) can inspect
//! progress without this crate.
//!
//! Wall-clock epochs go to disk for display; durations are measured with a
//! monotonic clock held in memory only. Readers treat the file values as
//! authoritative and leave the timer unset.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::error::{ErrorKind, Result};
use crate::{bail, pgclone_error};

/// Number of lines in a table or index summary file.
const COPY_SUMMARY_LINES: usize = 8;
/// Number of lines in a blobs summary file.
const BLOBS_SUMMARY_LINES: usize = 3;

fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// Writes file contents and flushes them before returning, so a done-file
/// rename (or the done file itself) never exposes a partially written record.
fn write_all_flushed(path: &Path, contents: &str) -> Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    file.sync_all()?;
    Ok(())
}

fn split_lines(path: &Path, minimum: usize) -> Result<Vec<String>> {
    let contents = fs::read_to_string(path)?;
    let lines: Vec<String> = contents.lines().map(str::to_string).collect();
    if lines.len() < minimum {
        bail!(
            ErrorKind::SummaryCorrupted,
            "summary file is truncated",
            format!(
                "file {path:?} contains only {} lines, at least {minimum} are expected",
                lines.len()
            )
        );
    }
    Ok(lines)
}

fn parse_line<T: std::str::FromStr>(lines: &[String], index: usize, what: &'static str) -> Result<T> {
    lines[index]
        .parse()
        .map_err(|_| pgclone_error!(ErrorKind::SummaryCorrupted, what, format!("{:?}", lines[index])))
}

/// Progress record for one table COPY (or one part of it).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSummary {
    pub pid: u32,
    pub oid: u32,
    pub nspname: String,
    pub relname: String,
    pub start_epoch: u64,
    pub done_epoch: u64,
    pub duration_ms: u64,
    pub command: String,
    /// Monotonic timer; never serialized, absent after a read-back.
    started: Option<Instant>,
}

impl TableSummary {
    pub fn new(pid: u32, oid: u32, nspname: &str, relname: &str, command: String) -> Self {
        TableSummary {
            pid,
            oid,
            nspname: nspname.to_string(),
            relname: relname.to_string(),
            command,
            ..Default::default()
        }
    }

    /// Starts the timers and writes the record, typically to the lock file.
    pub fn open(&mut self, lock_file: &Path) -> Result<()> {
        self.start_epoch = epoch_seconds();
        self.done_epoch = 0;
        self.duration_ms = 0;
        self.started = Some(Instant::now());
        self.write(lock_file)
    }

    /// Stops the timers and writes the record, typically to the done file.
    pub fn finish(&mut self, done_file: &Path) -> Result<()> {
        self.done_epoch = epoch_seconds();
        if let Some(started) = self.started {
            self.duration_ms = started.elapsed().as_millis() as u64;
        }
        self.write(done_file)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let contents = format!(
            "{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n",
            self.pid,
            self.oid,
            self.nspname,
            self.relname,
            self.start_epoch,
            self.done_epoch,
            self.duration_ms,
            self.command,
        );
        write_all_flushed(path, &contents)
    }

    pub fn read(path: &Path) -> Result<Self> {
        let lines = split_lines(path, COPY_SUMMARY_LINES)?;
        Ok(TableSummary {
            pid: parse_line(&lines, 0, "invalid pid in summary")?,
            oid: parse_line(&lines, 1, "invalid oid in summary")?,
            nspname: lines[2].clone(),
            relname: lines[3].clone(),
            start_epoch: parse_line(&lines, 4, "invalid start time in summary")?,
            done_epoch: parse_line(&lines, 5, "invalid done time in summary")?,
            duration_ms: parse_line(&lines, 6, "invalid duration in summary")?,
            command: lines[7].clone(),
            started: None,
        })
    }
}

/// Progress record for one CREATE INDEX or ADD CONSTRAINT step.
///
/// The two steps share the summary layout but record different oids and
/// names, and use two distinct done files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexSummary {
    pub pid: u32,
    pub oid: u32,
    pub nspname: String,
    pub name: String,
    pub start_epoch: u64,
    pub done_epoch: u64,
    pub duration_ms: u64,
    pub command: String,
    started: Option<Instant>,
}

impl IndexSummary {
    pub fn new(pid: u32, oid: u32, nspname: &str, name: &str, command: String) -> Self {
        IndexSummary {
            pid,
            oid,
            nspname: nspname.to_string(),
            name: name.to_string(),
            command,
            ..Default::default()
        }
    }

    pub fn open(&mut self, lock_file: &Path) -> Result<()> {
        self.start_epoch = epoch_seconds();
        self.done_epoch = 0;
        self.duration_ms = 0;
        self.started = Some(Instant::now());
        self.write(lock_file)
    }

    pub fn finish(&mut self, done_file: &Path) -> Result<()> {
        self.done_epoch = epoch_seconds();
        if let Some(started) = self.started {
            self.duration_ms = started.elapsed().as_millis() as u64;
        }
        self.write(done_file)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let contents = format!(
            "{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n",
            self.pid,
            self.oid,
            self.nspname,
            self.name,
            self.start_epoch,
            self.done_epoch,
            self.duration_ms,
            self.command,
        );
        write_all_flushed(path, &contents)
    }

    pub fn read(path: &Path) -> Result<Self> {
        let lines = split_lines(path, COPY_SUMMARY_LINES)?;
        Ok(IndexSummary {
            pid: parse_line(&lines, 0, "invalid pid in summary")?,
            oid: parse_line(&lines, 1, "invalid oid in summary")?,
            nspname: lines[2].clone(),
            name: lines[3].clone(),
            start_epoch: parse_line(&lines, 4, "invalid start time in summary")?,
            done_epoch: parse_line(&lines, 5, "invalid done time in summary")?,
            duration_ms: parse_line(&lines, 6, "invalid duration in summary")?,
            command: lines[7].clone(),
            started: None,
        })
    }
}

/// Progress record for the large objects worker.
///
/// The count is a `u64` in memory but the on-disk field stays 32-bit for
/// compatibility with earlier readers; writes saturate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlobsSummary {
    pub pid: u32,
    pub count: u64,
    pub duration_ms: u64,
}

impl BlobsSummary {
    pub fn write(&self, path: &Path) -> Result<()> {
        let count = u32::try_from(self.count).unwrap_or(u32::MAX);
        write_all_flushed(path, &format!("{}\n{count}\n{}\n", self.pid, self.duration_ms))
    }

    pub fn read(path: &Path) -> Result<Self> {
        let lines = split_lines(path, BLOBS_SUMMARY_LINES)?;
        let count: u32 = parse_line(&lines, 1, "invalid blob count in summary")?;
        Ok(BlobsSummary {
            pid: parse_line(&lines, 0, "invalid pid in summary")?,
            count: count as u64,
            duration_ms: parse_line(&lines, 2, "invalid duration in summary")?,
        })
    }
}

/// Writes the index list file for a table: one pair of lines per index,
/// `index_oid` then `constraint_oid`, zero meaning "no backing constraint".
pub fn write_index_list(path: &Path, indexes: &[(u32, u32)]) -> Result<()> {
    let mut contents = String::new();
    for (index_oid, constraint_oid) in indexes {
        contents.push_str(&format!("{index_oid}\n{constraint_oid}\n"));
    }
    write_all_flushed(path, &contents)
}

/// Reads an index list file back. A missing file is an empty list: tables
/// without indexes never get one written.
pub fn read_index_list(path: &Path) -> Result<Vec<(u32, u32)>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let lines: Vec<&str> = contents.lines().collect();
    let mut indexes = Vec::with_capacity(lines.len() / 2);
    for pair in lines.chunks(2) {
        let [index_line, constraint_line] = pair else {
            bail!(
                ErrorKind::SummaryCorrupted,
                "index list file has an odd number of lines",
                format!("{path:?}")
            );
        };
        let index_oid = index_line.parse().map_err(|_| {
            pgclone_error!(ErrorKind::SummaryCorrupted, "invalid index oid", format!("{index_line:?}"))
        })?;
        let constraint_oid = constraint_line.parse().map_err(|_| {
            pgclone_error!(
                ErrorKind::SummaryCorrupted,
                "invalid constraint oid",
                format!("{constraint_line:?}")
            )
        })?;
        indexes.push((index_oid, constraint_oid));
    }

    Ok(indexes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn table_summary_round_trips_non_timer_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("16384.done");

        let mut summary = TableSummary::new(
            4242,
            16384,
            "public",
            "orders",
            "COPY \"public\".\"orders\" TO STDOUT".to_string(),
        );
        summary.open(&path).unwrap();
        summary.finish(&path).unwrap();

        let read_back = TableSummary::read(&path).unwrap();
        assert_eq!(read_back.pid, 4242);
        assert_eq!(read_back.oid, 16384);
        assert_eq!(read_back.nspname, "public");
        assert_eq!(read_back.relname, "orders");
        assert_eq!(read_back.start_epoch, summary.start_epoch);
        assert_eq!(read_back.done_epoch, summary.done_epoch);
        assert_eq!(read_back.duration_ms, summary.duration_ms);
        assert_eq!(read_back.command, summary.command);
    }

    #[test]
    fn table_summary_rejects_truncated_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.done");
        fs::write(&path, "1\n2\n3\n").unwrap();

        let err = TableSummary::read(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SummaryCorrupted);
    }

    #[test]
    fn table_summary_rejects_garbage_oid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.done");
        fs::write(&path, "1\nnot-an-oid\na\nb\n0\n0\n0\ncmd\n").unwrap();

        let err = TableSummary::read(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SummaryCorrupted);
    }

    #[test]
    fn index_summary_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("20001.done");

        let mut summary = IndexSummary::new(
            7,
            20001,
            "public",
            "orders_pkey",
            "CREATE UNIQUE INDEX orders_pkey ON public.orders (id)".to_string(),
        );
        summary.open(&path).unwrap();
        summary.finish(&path).unwrap();

        let read_back = IndexSummary::read(&path).unwrap();
        assert_eq!(read_back.oid, 20001);
        assert_eq!(read_back.name, "orders_pkey");
        assert_eq!(read_back.command, summary.command);
    }

    #[test]
    fn blobs_summary_clamps_count_on_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blobs.done");

        let summary = BlobsSummary {
            pid: 1,
            count: u64::from(u32::MAX) + 10,
            duration_ms: 12,
        };
        summary.write(&path).unwrap();

        let read_back = BlobsSummary::read(&path).unwrap();
        assert_eq!(read_back.count, u64::from(u32::MAX));
        assert_eq!(read_back.duration_ms, 12);
    }

    #[test]
    fn index_list_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("16384.idx");

        write_index_list(&path, &[(20001, 0), (20002, 20003)]).unwrap();
        assert_eq!(read_index_list(&path).unwrap(), vec![(20001, 0), (20002, 20003)]);
    }

    #[test]
    fn missing_index_list_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(read_index_list(&dir.path().join("nope.idx")).unwrap().is_empty());
    }

    #[test]
    fn empty_index_list_is_valid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.idx");
        write_index_list(&path, &[]).unwrap();
        assert!(read_index_list(&path).unwrap().is_empty());
    }

    #[test]
    fn odd_index_list_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("odd.idx");
        fs::write(&path, "20001\n0\n20002\n").unwrap();

        let err = read_index_list(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SummaryCorrupted);
    }
}
