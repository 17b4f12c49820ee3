//! The parallel copy orchestrator.
//!
//! Drives the full phase sequence: snapshot, schema dump, catalog fetch,
//! pre-data restore, the parallel table data phase with its index, vacuum and
//! large-objects fleets, sequence reset, and the post-data restore. Progress
//! is tracked on disk at every step, so a killed run resumes from where it
//! stopped with `--resume`.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use pgclone_config::{ByteSize, scrub_pguri};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::bail;
use crate::catalog::{SourceCatalog, reset_sequences};
use crate::concurrency::queue::bounded;
use crate::error::{Error, ErrorKind, Result};
use crate::pgcmd::{
    SchemaSection, apply_sql_file, pg_dump_section, pg_dumpall_roles, pg_restore_section,
};
use crate::pgsql::{ConnKind, PgConnection, copy_stream, qualified_name};
use crate::report::{RunSummary, StepTimer};
use crate::snapshot::SourceSnapshot;
use crate::supervisor::{Supervisor, drain_outcome};
use crate::workdir::{CopyFilePaths, init_workdir, remove_pidfile};
use crate::workers::blobs::spawn_blobs_worker;
use crate::workers::index::spawn_index_workers;
use crate::workers::table_copy::{TableCopyJob, spawn_table_copy_workers};
use crate::workers::vacuum::spawn_vacuum_workers;
use crate::workers::{CopyContext, SharedErrors, drain_workers};

/// Which slice of the whole operation this invocation covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    All,
    PreData,
    TableData,
    Indexes,
    Constraints,
    Sequences,
    Blobs,
    PostData,
}

/// The run plan, derived once from options and environment and read-only
/// afterwards.
#[derive(Debug, Clone)]
pub struct CopyPlan {
    pub source_pguri: String,
    pub target_pguri: String,
    pub dir: Option<PathBuf>,
    pub table_jobs: usize,
    pub index_jobs: usize,
    pub vacuum_jobs: usize,
    pub split_threshold: ByteSize,
    pub section: Section,
    pub snapshot: Option<String>,
    pub restart: bool,
    pub resume: bool,
    pub consistent: bool,
    pub skip_large_objects: bool,
    pub skip_extensions: bool,
    pub roles: bool,
    pub fail_fast: bool,
}

impl CopyPlan {
    /// Checks option consistency before any I/O happens. `--restart` takes
    /// precedence over `--resume`.
    pub fn validate(&self) -> Result<()> {
        if self.table_jobs == 0 || self.index_jobs == 0 || self.vacuum_jobs == 0 {
            bail!(
                ErrorKind::Configuration,
                "job counts must be positive",
                format!(
                    "table-jobs {}, index-jobs {}, vacuum-jobs {}",
                    self.table_jobs, self.index_jobs, self.vacuum_jobs
                )
            );
        }

        // Resuming cannot re-enter the snapshot the previous run exported
        // unless the user re-supplies it: a consistent resume needs
        // --snapshot, an inconsistent one needs --not-consistent.
        if self.resume && !self.restart && self.consistent && self.snapshot.is_none() {
            bail!(
                ErrorKind::Configuration,
                "--resume needs either --not-consistent or --snapshot",
                "the snapshot of the interrupted run cannot be re-exported"
            );
        }

        Ok(())
    }

    fn effective_resume(&self) -> bool {
        self.resume && !self.restart
    }
}

/// Owns the run: the plan, the work directory paths, the supervisor and the
/// deferred (non fail-fast) error sink.
pub struct CopyOrchestrator {
    plan: CopyPlan,
    paths: Arc<CopyFilePaths>,
    supervisor: Supervisor,
    errors: SharedErrors,
}

impl CopyOrchestrator {
    pub fn new(plan: CopyPlan) -> Result<Self> {
        plan.validate()?;
        let paths = Arc::new(CopyFilePaths::compute(plan.dir.as_deref(), false)?);
        Ok(CopyOrchestrator {
            plan,
            paths,
            supervisor: Supervisor::new(),
            errors: SharedErrors::default(),
        })
    }

    pub fn paths(&self) -> &CopyFilePaths {
        &self.paths
    }

    /// Runs the plan to completion and returns the final report.
    pub async fn run(mut self) -> Result<RunSummary> {
        let total = StepTimer::start();
        self.supervisor.listen_for_signals()?;

        init_workdir(&self.paths, self.plan.restart, self.plan.resume)?;

        info!(
            source = %scrub_pguri(&self.plan.source_pguri),
            target = %scrub_pguri(&self.plan.target_pguri),
            table_jobs = self.plan.table_jobs,
            index_jobs = self.plan.index_jobs,
            "starting database copy"
        );

        let mut summary = RunSummary {
            table_jobs: self.plan.table_jobs,
            index_jobs: self.plan.index_jobs,
            ..Default::default()
        };

        let mut snapshot = SourceSnapshot::new(
            &self.plan.source_pguri,
            self.plan.consistent,
            self.plan.snapshot.clone(),
        );

        let section = self.plan.section;
        let needs_snapshot = !matches!(section, Section::PreData | Section::PostData);
        if needs_snapshot {
            snapshot.prepare(&self.paths.snapshot_file).await?;
        }

        if self.plan.roles && matches!(section, Section::All) {
            self.copy_roles().await?;
        }

        if matches!(section, Section::All | Section::PreData | Section::PostData) {
            let timer = StepTimer::start();
            self.dump_schema(snapshot.id()).await?;
            summary.timings.dump_schema_ms = timer.elapsed_ms();
        }

        let catalog = if needs_snapshot {
            let timer = StepTimer::start();
            let catalog = self.fetch_or_load_catalog(&snapshot).await?;
            summary.timings.fetch_schema_ms = timer.elapsed_ms();
            catalog
        } else {
            SourceCatalog::default()
        };

        if matches!(section, Section::All | Section::PreData) {
            let timer = StepTimer::start();
            self.restore_section(SchemaSection::PreData).await?;
            summary.timings.prepare_schema_ms = timer.elapsed_ms();
        }

        if !self.plan.skip_extensions && matches!(section, Section::All) {
            self.copy_extensions(&snapshot, &catalog).await?;
        }

        match section {
            Section::All | Section::TableData => {
                let timer = StepTimer::start();
                self.copy_data_phase(&snapshot, &catalog).await?;
                summary.timings.data_and_indexes_ms = timer.elapsed_ms();
            }
            Section::Indexes | Section::Constraints => {
                self.index_phase_only(&catalog, section == Section::Constraints)
                    .await?;
            }
            Section::Blobs => {
                self.blobs_phase_only(&snapshot).await?;
            }
            _ => {}
        }

        if matches!(section, Section::All | Section::Sequences) {
            self.restore_sequences(&catalog).await?;
        }

        if matches!(section, Section::All | Section::PostData) {
            let timer = StepTimer::start();
            self.restore_section(SchemaSection::PostData).await?;
            summary.timings.finalize_schema_ms = timer.elapsed_ms();
        }

        snapshot.close().await?;
        self.supervisor.stop_listening();

        summary.collect(&self.paths, &catalog)?;
        summary.timings.total_ms = total.elapsed_ms();

        remove_pidfile(&self.paths);

        // Deferred per-table errors (--fail-fast=false) still fail the run,
        // after every sibling had its chance to finish.
        drain_outcome(self.errors.take())?;

        Ok(summary)
    }

    fn check_shutdown(&self) -> Result<()> {
        if self.supervisor.subscribe().is_requested() {
            bail!(ErrorKind::ShuttingDown, "shutdown requested");
        }
        Ok(())
    }

    async fn copy_roles(&self) -> Result<()> {
        pg_dumpall_roles(&self.plan.source_pguri, &self.paths.dumps.roles).await?;
        let target = PgConnection::connect(&self.plan.target_pguri, ConnKind::Target).await?;
        apply_sql_file(&target, &self.paths.dumps.roles).await?;
        Ok(())
    }

    /// Dumps the pre-data and post-data schema sections, bounded by the
    /// snapshot so the schema matches the data.
    async fn dump_schema(&self, snapshot: Option<&str>) -> Result<()> {
        self.check_shutdown()?;

        let steps = [
            (SchemaSection::PreData, &self.paths.dumps.pre_data, &self.paths.done.pre_data_dump),
            (SchemaSection::PostData, &self.paths.dumps.post_data, &self.paths.done.post_data_dump),
        ];

        for (section, dump_file, done_file) in steps {
            if self.plan.effective_resume() && done_file.exists() {
                info!(section = section.as_flag(), "schema already dumped, skipping");
                continue;
            }
            pg_dump_section(&self.plan.source_pguri, section, snapshot, dump_file).await?;
            fs::write(done_file, b"")?;
        }

        Ok(())
    }

    async fn restore_section(&self, section: SchemaSection) -> Result<()> {
        self.check_shutdown()?;

        let (dump_file, done_file) = match section {
            SchemaSection::PreData => (&self.paths.dumps.pre_data, &self.paths.done.pre_data_restore),
            SchemaSection::PostData => {
                (&self.paths.dumps.post_data, &self.paths.done.post_data_restore)
            }
        };

        if self.plan.effective_resume() && done_file.exists() {
            info!(section = section.as_flag(), "schema already restored, skipping");
            return Ok(());
        }

        pg_restore_section(&self.plan.target_pguri, dump_file, None).await?;
        fs::write(done_file, b"")?;
        Ok(())
    }

    /// Fetches the catalog on the snapshot connection, or reloads the one a
    /// previous run persisted so a resume works from the identical plan.
    async fn fetch_or_load_catalog(&self, snapshot: &SourceSnapshot) -> Result<SourceCatalog> {
        if self.plan.effective_resume() && self.paths.schema_file.exists() {
            info!(file = %self.paths.schema_file.display(), "reusing catalog from previous run");
            return SourceCatalog::load(&self.paths.schema_file);
        }

        let fallback;
        let conn = match snapshot.connection() {
            Some(conn) => conn,
            None => {
                fallback = PgConnection::connect(&self.plan.source_pguri, ConnKind::Source).await?;
                &fallback
            }
        };

        let catalog = SourceCatalog::fetch(conn, self.plan.split_threshold.bytes).await?;
        catalog.save(&self.paths.schema_file)?;
        Ok(catalog)
    }

    async fn copy_extensions(
        &self,
        snapshot: &SourceSnapshot,
        catalog: &SourceCatalog,
    ) -> Result<()> {
        if catalog.extensions.is_empty() {
            return Ok(());
        }

        let target = PgConnection::connect(&self.plan.target_pguri, ConnKind::Target).await?;
        let worker_snapshot = snapshot.to_worker();

        for extension in &catalog.extensions {
            self.check_shutdown()?;

            let sql = format!(
                "CREATE EXTENSION IF NOT EXISTS {} CASCADE",
                pg_escape::quote_identifier(&extension.name)
            );
            info!(extension = %extension.name, "creating extension");
            if let Err(err) = target.execute(&sql).await {
                if self.plan.fail_fast {
                    return Err(err);
                }
                self.errors.push(err);
                continue;
            }

            if extension.configs.is_empty() {
                continue;
            }

            let source = worker_snapshot.connect().await?;
            for config in &extension.configs {
                let table = qualified_name(&config.nspname, &config.relname);
                info!(extension = %extension.name, table = %table, "copying extension configuration table");

                target.execute(&format!("TRUNCATE {table}")).await?;
                let copy_out = format!(
                    "COPY (SELECT * FROM {table} {}) TO STDOUT",
                    config.condition
                );
                let copy_in = format!("COPY {table} FROM STDIN");
                copy_stream(&source, &target, copy_out.trim(), &copy_in).await?;
            }
        }

        Ok(())
    }

    /// The parallel phase: COPY workers feeding index and vacuum fleets
    /// through bounded queues, with the large objects worker running along.
    async fn copy_data_phase(
        &mut self,
        snapshot: &SourceSnapshot,
        catalog: &SourceCatalog,
    ) -> Result<()> {
        self.check_shutdown()?;

        // A fully completed data phase resumes to a no-op: no connections,
        // no COPY, no index builds.
        if self.plan.effective_resume()
            && self.paths.done.tables.exists()
            && self.paths.done.indexes.exists()
        {
            info!("table data and indexes already done, skipping");
            return Ok(());
        }

        let ctx = CopyContext {
            paths: Arc::clone(&self.paths),
            snapshot: snapshot.to_worker(),
            target_pguri: self.plan.target_pguri.clone(),
            resume: self.plan.effective_resume(),
            fail_fast: self.plan.fail_fast,
            shutdown: self.supervisor.subscribe(),
            errors: self.errors.clone(),
            table_semaphore: Arc::new(Semaphore::new(1)),
        };

        // The index, vacuum and blobs fleets only run for the full phase;
        // `copy table-data` stops at the COPYs.
        let full_phase = self.plan.section == Section::All;

        let (table_tx, table_rx) = bounded::<TableCopyJob>(self.plan.table_jobs * 2);

        let (index_tx, index_fleet, vacuum_tx, vacuum_fleet) = if full_phase {
            let (index_tx, index_rx) = bounded(self.plan.index_jobs * 2);
            let (vacuum_tx, vacuum_rx) = bounded(self.plan.vacuum_jobs * 2);
            let index_fleet = spawn_index_workers(self.plan.index_jobs, ctx.clone(), index_rx);
            let vacuum_fleet = spawn_vacuum_workers(self.plan.vacuum_jobs, ctx.clone(), vacuum_rx);
            (Some(index_tx), Some(index_fleet), Some(vacuum_tx), Some(vacuum_fleet))
        } else {
            (None, None, None, None)
        };

        let copy_fleet = spawn_table_copy_workers(
            self.plan.table_jobs,
            ctx.clone(),
            table_rx,
            index_tx.clone(),
            vacuum_tx.clone(),
        );

        let blobs_fleet = if self.plan.skip_large_objects || !full_phase {
            None
        } else {
            Some(spawn_blobs_worker(ctx.clone()))
        };

        // Dispatch every table, partitioned ones part by part in order.
        let mut dispatched = 0usize;
        'dispatch: for table in &catalog.tables {
            let table = Arc::new(table.clone());
            if table.is_partitioned() {
                for part in &table.parts {
                    if ctx.shutdown.is_requested() {
                        break 'dispatch;
                    }
                    table_tx
                        .send(TableCopyJob {
                            table: Arc::clone(&table),
                            part: Some(*part),
                        })
                        .await?;
                    dispatched += 1;
                }
            } else {
                if ctx.shutdown.is_requested() {
                    break 'dispatch;
                }
                table_tx
                    .send(TableCopyJob {
                        table: Arc::clone(&table),
                        part: None,
                    })
                    .await?;
                dispatched += 1;
            }
        }
        table_tx.close();
        info!(jobs = dispatched, tables = catalog.tables.len(), "dispatched table copy jobs");

        // COPY workers are the producers of the index and vacuum queues, so
        // those close once the fleet is drained and our clones are dropped.
        let mut fatal = drain_workers(copy_fleet).await;
        if !fatal.is_empty() {
            // Stop dispatching further downstream work.
            self.supervisor.trigger();
        }
        if let Some(index_tx) = index_tx {
            index_tx.close();
        }
        if let Some(vacuum_tx) = vacuum_tx {
            vacuum_tx.close();
        }

        if let Some(index_fleet) = index_fleet {
            fatal.extend(drain_workers(index_fleet).await);
        }
        if let Some(vacuum_fleet) = vacuum_fleet {
            fatal.extend(drain_workers(vacuum_fleet).await);
        }
        if let Some(blobs_fleet) = blobs_fleet {
            fatal.extend(drain_workers(blobs_fleet).await);
        }

        if !fatal.is_empty() {
            return Err(Error::from_many(fatal));
        }
        self.check_shutdown()?;

        if self.errors.is_empty() {
            fs::write(&self.paths.done.tables, b"")?;
            if full_phase {
                fs::write(&self.paths.done.indexes, b"")?;
            }
        } else {
            warn!("some steps failed, leaving section done files unwritten");
        }

        Ok(())
    }

    /// `copy indexes` / `copy constraints`: build from the done files of an
    /// earlier table-data run without copying any data.
    async fn index_phase_only(&self, catalog: &SourceCatalog, constraints_only: bool) -> Result<()> {
        let target = PgConnection::connect(&self.plan.target_pguri, ConnKind::Target).await?;

        for table in &catalog.tables {
            for index in &table.indexes {
                self.check_shutdown()?;
                let paths = self.paths.index_paths(index.index_oid);

                if !constraints_only && !paths.done_file.exists() {
                    let mut summary = crate::summary::IndexSummary::new(
                        std::process::id(),
                        index.index_oid,
                        &index.nspname,
                        &index.relname,
                        index.index_def.clone(),
                    );
                    summary.open(&paths.lock_file)?;
                    target.execute(&index.index_def).await?;
                    summary.finish(&paths.done_file)?;
                    let _ = fs::remove_file(&paths.lock_file);
                }

                if index.has_constraint() && !paths.constraint_done_file.exists() {
                    let command = crate::workers::index::constraint_sql_for(table, index);
                    let mut summary = crate::summary::IndexSummary::new(
                        std::process::id(),
                        index.constraint_oid,
                        &index.nspname,
                        &index.constraint_name,
                        command.clone(),
                    );
                    summary.open(&paths.constraint_lock_file)?;
                    target.execute(&command).await?;
                    summary.finish(&paths.constraint_done_file)?;
                    let _ = fs::remove_file(&paths.constraint_lock_file);
                }
            }
        }

        Ok(())
    }

    async fn blobs_phase_only(&self, snapshot: &SourceSnapshot) -> Result<()> {
        let ctx = CopyContext {
            paths: Arc::clone(&self.paths),
            snapshot: snapshot.to_worker(),
            target_pguri: self.plan.target_pguri.clone(),
            resume: self.plan.effective_resume(),
            fail_fast: self.plan.fail_fast,
            shutdown: self.supervisor.subscribe(),
            errors: self.errors.clone(),
            table_semaphore: Arc::new(Semaphore::new(1)),
        };

        let errors = drain_workers(spawn_blobs_worker(ctx)).await;
        if !errors.is_empty() {
            return Err(Error::from_many(errors));
        }
        Ok(())
    }

    async fn restore_sequences(&self, catalog: &SourceCatalog) -> Result<()> {
        self.check_shutdown()?;

        if self.plan.effective_resume() && self.paths.done.sequences.exists() {
            info!("sequences already restored, skipping");
            return Ok(());
        }

        info!(count = catalog.sequences.len(), "restoring sequence values");
        let target = PgConnection::connect(&self.plan.target_pguri, ConnKind::Target).await?;
        reset_sequences(&target, &catalog.sequences).await?;
        fs::write(&self.paths.done.sequences, b"")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> CopyPlan {
        CopyPlan {
            source_pguri: "postgres://localhost/src".into(),
            target_pguri: "postgres://localhost/dst".into(),
            dir: None,
            table_jobs: 4,
            index_jobs: 4,
            vacuum_jobs: 4,
            split_threshold: ByteSize::default(),
            section: Section::All,
            snapshot: None,
            restart: false,
            resume: false,
            consistent: true,
            skip_large_objects: false,
            skip_extensions: false,
            roles: false,
            fail_fast: true,
        }
    }

    #[test]
    fn zero_jobs_are_rejected() {
        let mut plan = plan();
        plan.table_jobs = 0;
        assert_eq!(plan.validate().unwrap_err().kind(), ErrorKind::Configuration);
    }

    #[test]
    fn consistent_resume_needs_a_snapshot() {
        let mut plan = plan();
        plan.resume = true;
        assert_eq!(plan.validate().unwrap_err().kind(), ErrorKind::Configuration);

        plan.snapshot = Some("00000003-000001B8-1".into());
        plan.validate().unwrap();
    }

    #[test]
    fn restart_takes_precedence_over_resume() {
        let mut plan = plan();
        plan.restart = true;
        plan.resume = true;
        plan.validate().unwrap();
        assert!(!plan.effective_resume());
    }

    #[test]
    fn inconsistent_resume_is_accepted() {
        let mut plan = plan();
        plan.resume = true;
        plan.consistent = false;
        plan.validate().unwrap();
        assert!(plan.effective_resume());
    }
}
