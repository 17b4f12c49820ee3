//! Work directory layout and state machine.
//!
//! Every run owns a single top directory holding the pidfile, the exported
//! snapshot, schema dumps, per-table and per-index progress files, and the
//! change data capture files. The presence of small "done" marker files is
//! what makes the whole operation idempotent and resumable: inspecting the
//! directory tells us exactly which phases a previous run completed.

use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{ErrorKind, Result};
use crate::{bail, pgclone_error};

/// Directory mode for everything we create under the top directory.
const WORKDIR_MODE: u32 = 0o700;

/// Section-level done files, one per phase of the copy.
#[derive(Debug, Clone)]
pub struct SectionDoneFiles {
    pub pre_data_dump: PathBuf,
    pub post_data_dump: PathBuf,
    pub pre_data_restore: PathBuf,
    pub post_data_restore: PathBuf,
    pub tables: PathBuf,
    pub indexes: PathBuf,
    pub sequences: PathBuf,
    pub blobs: PathBuf,
}

/// Files used by the change data capture processes.
///
/// These live apart from the transient run files: when no explicit directory
/// is given they default to the per-user data home rather than a tmpdir,
/// because WAL jsonl/sql files must survive reboots.
#[derive(Debug, Clone)]
pub struct CdcPaths {
    pub dir: PathBuf,
    pub origin_file: PathBuf,
    pub tli_file: PathBuf,
    pub tli_history_file: PathBuf,
    pub wal_segment_size_file: PathBuf,
}

/// Output files for the schema dump/restore subprocesses.
#[derive(Debug, Clone)]
pub struct DumpPaths {
    pub roles: PathBuf,
    pub pre_data: PathBuf,
    pub post_data: PathBuf,
    pub pre_list: PathBuf,
    pub post_list: PathBuf,
}

/// All the paths a run needs, computed once from the top directory.
#[derive(Debug, Clone)]
pub struct CopyFilePaths {
    pub topdir: PathBuf,
    pub pidfile: PathBuf,
    pub snapshot_file: PathBuf,
    pub schema_dir: PathBuf,
    /// JSON rendition of the source catalog, used by --resume and reporting.
    pub schema_file: PathBuf,
    pub run_dir: PathBuf,
    pub table_dir: PathBuf,
    pub index_dir: PathBuf,
    pub done: SectionDoneFiles,
    pub cdc: CdcPaths,
    pub dumps: DumpPaths,
}

/// Per-table progress files. Partitioned tables get one lock/done pair per
/// part; the index list and truncate marker stay table-level.
#[derive(Debug, Clone)]
pub struct TableFilePaths {
    pub lock_file: PathBuf,
    pub done_file: PathBuf,
    pub idx_list_file: PathBuf,
    pub truncate_done_file: PathBuf,
}

/// Per-index progress files; the constraint step has its own pair.
#[derive(Debug, Clone)]
pub struct IndexFilePaths {
    pub lock_file: PathBuf,
    pub done_file: PathBuf,
    pub constraint_lock_file: PathBuf,
    pub constraint_done_file: PathBuf,
}

impl CopyFilePaths {
    /// Computes every path from the given top directory.
    ///
    /// When `dir` is empty the top directory defaults to `$TMPDIR/pgclone`,
    /// and the CDC directory to `$XDG_DATA_HOME/pgclone` (falling back to
    /// `~/.local/share/pgclone`). Auxiliary processes sharing the work dir of
    /// a main process use a different pidfile.
    pub fn compute(dir: Option<&Path>, auxiliary: bool) -> Result<Self> {
        let topdir = match dir {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => std::env::temp_dir().join("pgclone"),
        };

        let pidfile = if auxiliary {
            topdir.join("pgclone.aux.pid")
        } else {
            topdir.join("pgclone.pid")
        };

        let schema_dir = topdir.join("schema");
        let run_dir = topdir.join("run");
        let table_dir = run_dir.join("tables");
        let index_dir = run_dir.join("indexes");

        let done = SectionDoneFiles {
            pre_data_dump: run_dir.join("dump-pre.done"),
            post_data_dump: run_dir.join("dump-post.done"),
            pre_data_restore: run_dir.join("restore-pre.done"),
            post_data_restore: run_dir.join("restore-post.done"),
            tables: run_dir.join("tables.done"),
            indexes: run_dir.join("indexes.done"),
            sequences: run_dir.join("sequences.done"),
            blobs: run_dir.join("blobs.done"),
        };

        let cdc_dir = match dir {
            Some(dir) if !dir.as_os_str().is_empty() => dir.join("cdc"),
            _ => {
                let data_home = match std::env::var_os("XDG_DATA_HOME") {
                    Some(data_home) if !data_home.is_empty() => PathBuf::from(data_home),
                    _ => dirs::home_dir()
                        .ok_or_else(|| {
                            pgclone_error!(
                                ErrorKind::Configuration,
                                "cannot locate the user home directory for cdc files"
                            )
                        })?
                        .join(".local/share"),
                };
                data_home.join("pgclone")
            }
        };

        let cdc = CdcPaths {
            origin_file: cdc_dir.join("origin"),
            tli_file: cdc_dir.join("tli"),
            tli_history_file: cdc_dir.join("tli.history"),
            wal_segment_size_file: cdc_dir.join("wal_segment_size"),
            dir: cdc_dir,
        };

        let dumps = DumpPaths {
            roles: schema_dir.join("roles.sql"),
            pre_data: schema_dir.join("pre.dump"),
            post_data: schema_dir.join("post.dump"),
            pre_list: schema_dir.join("pre.list"),
            post_list: schema_dir.join("post.list"),
        };

        Ok(CopyFilePaths {
            snapshot_file: topdir.join("snapshot"),
            schema_file: topdir.join("schema.json"),
            pidfile,
            schema_dir,
            run_dir,
            table_dir,
            index_dir,
            done,
            cdc,
            dumps,
            topdir,
        })
    }

    /// Progress files for a table copied in one piece.
    pub fn table_paths(&self, oid: u32) -> TableFilePaths {
        TableFilePaths {
            lock_file: self.run_dir.join(format!("{oid}")),
            done_file: self.table_dir.join(format!("{oid}.done")),
            idx_list_file: self.table_dir.join(format!("{oid}.idx")),
            truncate_done_file: self.table_dir.join(format!("{oid}.truncate")),
        }
    }

    /// Progress files for one part of a partitioned table COPY.
    pub fn table_part_paths(&self, oid: u32, part_number: u32) -> TableFilePaths {
        TableFilePaths {
            lock_file: self.run_dir.join(format!("{oid}.{part_number}")),
            done_file: self.table_dir.join(format!("{oid}.{part_number}.done")),
            idx_list_file: self.table_dir.join(format!("{oid}.idx")),
            truncate_done_file: self.table_dir.join(format!("{oid}.truncate")),
        }
    }

    /// Progress files for one index and its optional backing constraint.
    pub fn index_paths(&self, index_oid: u32) -> IndexFilePaths {
        IndexFilePaths {
            lock_file: self.index_dir.join(format!("{index_oid}")),
            done_file: self.index_dir.join(format!("{index_oid}.done")),
            constraint_lock_file: self.index_dir.join(format!("{index_oid}.constraint")),
            constraint_done_file: self.index_dir.join(format!("{index_oid}.constraint.done")),
        }
    }
}

/// Classification of an existing work directory.
///
/// `all_done` holds exactly when all seven phase bits hold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkDirState {
    pub directory_exists: bool,
    pub directory_is_ready: bool,
    pub schema_dump_done: bool,
    pub pre_data_restored: bool,
    pub post_data_restored: bool,
    pub tables_done: bool,
    pub indexes_done: bool,
    pub sequences_done: bool,
    pub blobs_done: bool,
    pub all_done: bool,
}

/// Inspects the work directory and reports which phases a previous run
/// completed. Pure over the filesystem snapshot: only file presence drives
/// the state bits.
pub fn inspect_workdir(paths: &CopyFilePaths) -> WorkDirState {
    let mut state = WorkDirState::default();

    state.directory_exists = paths.topdir.is_dir();
    if !state.directory_exists {
        return state;
    }

    let components = [&paths.schema_dir, &paths.run_dir, &paths.table_dir, &paths.index_dir];
    if !components.iter().all(|dir| dir.is_dir()) {
        debug!(topdir = %paths.topdir.display(), "not all component directories found");
        state.directory_is_ready = false;
        return state;
    }
    state.directory_is_ready = true;

    state.schema_dump_done =
        paths.done.pre_data_dump.exists() && paths.done.post_data_dump.exists();
    state.pre_data_restored = paths.done.pre_data_restore.exists();
    state.post_data_restored = paths.done.post_data_restore.exists();
    state.tables_done = paths.done.tables.exists();
    state.indexes_done = paths.done.indexes.exists();
    state.sequences_done = paths.done.sequences.exists();
    state.blobs_done = paths.done.blobs.exists();

    state.all_done = state.schema_dump_done
        && state.pre_data_restored
        && state.post_data_restored
        && state.tables_done
        && state.indexes_done
        && state.sequences_done
        && state.blobs_done;

    state
}

/// Prepares the work directory for a run.
///
/// Follows the decision table: `restart` removes and recreates; a directory
/// with no schema dump yet proceeds as if fresh; `resume` proceeds in place;
/// an `all_done` directory requires `--restart`; any other in-progress state
/// requires `--resume`. A pidfile referencing a live process always fails.
pub fn init_workdir(paths: &CopyFilePaths, restart: bool, resume: bool) -> Result<WorkDirState> {
    info!(topdir = %paths.topdir.display(), "using work dir");

    if paths.topdir.is_dir()
        && let Some(pid) = read_pidfile(&paths.pidfile)?
    {
        bail!(
            ErrorKind::WorkDirBusy,
            "work directory already in use",
            format!(
                "directory {:?} contains a pidfile for process {pid}, which is currently running",
                paths.topdir
            )
        );
    }

    let state = inspect_workdir(paths);

    if !restart && state.directory_exists {
        if !state.schema_dump_done {
            debug!("schema dump has not been done yet, just continue");
        } else if resume {
            // in-progress directory, resuming is what --resume asks for
        } else if state.all_done {
            bail!(
                ErrorKind::WorkDirState,
                "work directory belongs to a completed previous run",
                "use --restart to allow removing files from the completed run"
            );
        } else {
            bail!(
                ErrorKind::WorkDirState,
                "work directory belongs to an unfinished previous run",
                "use --resume to continue from where the previous run stopped"
            );
        }
    }

    if restart && state.directory_exists {
        info!(topdir = %paths.topdir.display(), "removing work dir");
        fs::remove_dir_all(&paths.topdir)?;
    }

    let dirs = [
        &paths.topdir,
        &paths.schema_dir,
        &paths.run_dir,
        &paths.table_dir,
        &paths.index_dir,
        &paths.cdc.dir,
    ];
    for dir in dirs {
        create_dir_0700(dir)?;
    }

    fs::write(&paths.pidfile, format!("{}\n", std::process::id()))?;

    Ok(state)
}

/// Removes the pidfile written by [`init_workdir`], ignoring a missing file.
pub fn remove_pidfile(paths: &CopyFilePaths) {
    if let Err(err) = fs::remove_file(&paths.pidfile)
        && err.kind() != std::io::ErrorKind::NotFound
    {
        warn!(pidfile = %paths.pidfile.display(), error = %err, "failed to remove pidfile");
    }
}

fn create_dir_0700(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    fs::DirBuilder::new()
        .recursive(true)
        .mode(WORKDIR_MODE)
        .create(dir)?;
    Ok(())
}

/// Reads a pidfile and returns the pid when it belongs to a live process.
///
/// Unreadable content and stale pids remove the file; only the happy path of
/// a live owning process is reported back to the caller.
pub fn read_pidfile(pidfile: &Path) -> Result<Option<u32>> {
    let contents = match fs::read_to_string(pidfile) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    match contents.trim().parse::<u32>() {
        Ok(pid) if pid_is_running(pid) => Ok(Some(pid)),
        Ok(pid) => {
            debug!(pid, pidfile = %pidfile.display(), "removing stale pidfile");
            fs::remove_file(pidfile)?;
            Ok(None)
        }
        Err(_) => {
            warn!(pidfile = %pidfile.display(), "removing unreadable pidfile");
            fs::remove_file(pidfile)?;
            Ok(None)
        }
    }
}

/// True when a process with the given pid exists.
pub fn pid_is_running(pid: u32) -> bool {
    // Signal 0 performs the permission checks without delivering anything.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn paths_in(dir: &TempDir) -> CopyFilePaths {
        CopyFilePaths::compute(Some(&dir.path().join("work")), false).unwrap()
    }

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"").unwrap();
    }

    #[test]
    fn compute_lays_out_expected_tree() {
        let paths = CopyFilePaths::compute(Some(Path::new("/work/run1")), false).unwrap();
        assert_eq!(paths.pidfile, Path::new("/work/run1/pgclone.pid"));
        assert_eq!(paths.done.tables, Path::new("/work/run1/run/tables.done"));
        assert_eq!(paths.cdc.dir, Path::new("/work/run1/cdc"));
        assert_eq!(paths.dumps.pre_data, Path::new("/work/run1/schema/pre.dump"));
    }

    #[test]
    fn auxiliary_process_uses_own_pidfile() {
        let paths = CopyFilePaths::compute(Some(Path::new("/work/run1")), true).unwrap();
        assert_eq!(paths.pidfile, Path::new("/work/run1/pgclone.aux.pid"));
    }

    #[test]
    fn table_part_paths_split_lock_and_done() {
        let paths = CopyFilePaths::compute(Some(Path::new("/w")), false).unwrap();
        let whole = paths.table_paths(16384);
        let part = paths.table_part_paths(16384, 2);
        assert_eq!(whole.lock_file, Path::new("/w/run/16384"));
        assert_eq!(part.lock_file, Path::new("/w/run/16384.2"));
        assert_eq!(part.done_file, Path::new("/w/run/tables/16384.2.done"));
        // The index list stays table-level regardless of the part.
        assert_eq!(whole.idx_list_file, part.idx_list_file);
    }

    #[test]
    fn inspect_missing_directory() {
        let dir = TempDir::new().unwrap();
        let state = inspect_workdir(&paths_in(&dir));
        assert!(!state.directory_exists);
        assert!(!state.all_done);
    }

    #[test]
    fn inspect_requires_all_component_dirs() {
        let dir = TempDir::new().unwrap();
        let paths = paths_in(&dir);
        fs::create_dir_all(&paths.schema_dir).unwrap();
        fs::create_dir_all(&paths.run_dir).unwrap();
        // table_dir and index_dir missing
        let state = inspect_workdir(&paths);
        assert!(state.directory_exists);
        assert!(!state.directory_is_ready);
    }

    fn make_all_done(paths: &CopyFilePaths) {
        for dir in [&paths.schema_dir, &paths.run_dir, &paths.table_dir, &paths.index_dir] {
            fs::create_dir_all(dir).unwrap();
        }
        for done in [
            &paths.done.pre_data_dump,
            &paths.done.post_data_dump,
            &paths.done.pre_data_restore,
            &paths.done.post_data_restore,
            &paths.done.tables,
            &paths.done.indexes,
            &paths.done.sequences,
            &paths.done.blobs,
        ] {
            touch(done);
        }
    }

    #[test]
    fn inspect_all_done_requires_every_phase() {
        let dir = TempDir::new().unwrap();
        let paths = paths_in(&dir);
        make_all_done(&paths);
        assert!(inspect_workdir(&paths).all_done);

        fs::remove_file(&paths.done.sequences).unwrap();
        let state = inspect_workdir(&paths);
        assert!(!state.all_done);
        assert!(state.tables_done);
        assert!(!state.sequences_done);
    }

    #[test]
    fn init_fails_on_completed_run_without_restart() {
        let dir = TempDir::new().unwrap();
        let paths = paths_in(&dir);
        make_all_done(&paths);

        let err = init_workdir(&paths, false, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WorkDirState);
        assert!(err.to_string().contains("--restart"));
    }

    #[test]
    fn init_fails_on_unfinished_run_without_resume() {
        let dir = TempDir::new().unwrap();
        let paths = paths_in(&dir);
        make_all_done(&paths);
        fs::remove_file(&paths.done.tables).unwrap();

        let err = init_workdir(&paths, false, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WorkDirState);
        assert!(err.to_string().contains("--resume"));
    }

    #[test]
    fn init_resume_keeps_progress_files() {
        let dir = TempDir::new().unwrap();
        let paths = paths_in(&dir);
        make_all_done(&paths);
        fs::remove_file(&paths.done.tables).unwrap();

        init_workdir(&paths, false, true).unwrap();
        assert!(paths.done.pre_data_dump.exists());
        assert!(paths.pidfile.exists());
    }

    #[test]
    fn init_restart_removes_previous_run() {
        let dir = TempDir::new().unwrap();
        let paths = paths_in(&dir);
        make_all_done(&paths);

        init_workdir(&paths, true, false).unwrap();
        assert!(!paths.done.pre_data_dump.exists());
        assert!(paths.run_dir.is_dir());
    }

    #[test]
    fn init_fails_when_pidfile_owner_is_alive() {
        let dir = TempDir::new().unwrap();
        let paths = paths_in(&dir);
        make_all_done(&paths);
        fs::write(&paths.pidfile, format!("{}\n", std::process::id())).unwrap();

        let err = init_workdir(&paths, true, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WorkDirBusy);
    }

    #[test]
    fn stale_pidfile_is_taken_over() {
        let dir = TempDir::new().unwrap();
        let paths = paths_in(&dir);
        make_all_done(&paths);
        // Pid 4194304 is above the default pid_max on Linux.
        fs::write(&paths.pidfile, "4194304\n").unwrap();

        init_workdir(&paths, true, false).unwrap();
        let contents = fs::read_to_string(&paths.pidfile).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
    }

    #[test]
    fn fresh_directory_proceeds_without_flags() {
        let dir = TempDir::new().unwrap();
        let paths = paths_in(&dir);
        let state = init_workdir(&paths, false, false).unwrap();
        assert!(!state.directory_exists);
        assert!(paths.table_dir.is_dir());
        assert!(paths.cdc.dir.is_dir());
    }
}
