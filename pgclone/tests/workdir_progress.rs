//! Work directory progress tracking, across the same file layout a real run
//! produces: summaries as lock/done files, index lists, section markers, and
//! the final report collected back from disk.

use std::fs;

use pgclone::catalog::{SourceCatalog, SourceIndex, SourceTable, TablePart};
use pgclone::report::RunSummary;
use pgclone::summary::{IndexSummary, TableSummary, read_index_list, write_index_list};
use pgclone::workdir::{CopyFilePaths, init_workdir, inspect_workdir};
use tempfile::TempDir;

fn table(oid: u32, relname: &str, indexes: Vec<SourceIndex>, parts: Vec<TablePart>) -> SourceTable {
    SourceTable {
        oid,
        nspname: "public".to_string(),
        relname: relname.to_string(),
        bytes: 1024,
        bytes_pretty: "1 kB".to_string(),
        reltuples: 10,
        part_key: if parts.is_empty() { None } else { Some("id".to_string()) },
        parts,
        indexes,
    }
}

fn index(index_oid: u32, constraint_oid: u32, table_oid: u32) -> SourceIndex {
    SourceIndex {
        index_oid,
        constraint_oid,
        nspname: "public".to_string(),
        relname: format!("idx_{index_oid}"),
        constraint_name: if constraint_oid == 0 {
            String::new()
        } else {
            format!("con_{constraint_oid}")
        },
        index_def: format!("CREATE INDEX idx_{index_oid} ON public.t USING btree (id)"),
        constraint_def: if constraint_oid == 0 {
            String::new()
        } else {
            "PRIMARY KEY (id)".to_string()
        },
        table_oid,
    }
}

/// Writes the done file a finished COPY leaves behind.
fn finish_table(paths: &CopyFilePaths, table: &SourceTable, part: Option<u32>) {
    let table_paths = match part {
        Some(part) => paths.table_part_paths(table.oid, part),
        None => paths.table_paths(table.oid),
    };
    let mut summary = TableSummary::new(
        std::process::id(),
        table.oid,
        &table.nspname,
        &table.relname,
        format!("COPY {}.{} TO STDOUT", table.nspname, table.relname),
    );
    summary.open(&table_paths.lock_file).unwrap();
    summary.finish(&table_paths.done_file).unwrap();
    fs::remove_file(&table_paths.lock_file).unwrap();
}

fn finish_index(paths: &CopyFilePaths, index: &SourceIndex) {
    let index_paths = paths.index_paths(index.index_oid);
    let mut summary = IndexSummary::new(
        std::process::id(),
        index.index_oid,
        &index.nspname,
        &index.relname,
        index.index_def.clone(),
    );
    summary.open(&index_paths.lock_file).unwrap();
    summary.finish(&index_paths.done_file).unwrap();
    fs::remove_file(&index_paths.lock_file).unwrap();
}

#[test]
fn report_collects_per_table_durations_from_done_files() {
    let dir = TempDir::new().unwrap();
    let paths = CopyFilePaths::compute(Some(dir.path()), false).unwrap();
    init_workdir(&paths, false, false).unwrap();

    let catalog = SourceCatalog {
        tables: vec![
            table(16384, "orders", vec![index(20001, 20002, 16384)], Vec::new()),
            table(16385, "events", Vec::new(), Vec::new()),
        ],
        ..Default::default()
    };

    for source_table in &catalog.tables {
        finish_table(&paths, source_table, None);
        write_index_list(
            &paths.table_paths(source_table.oid).idx_list_file,
            &source_table.index_oid_pairs(),
        )
        .unwrap();
    }
    finish_index(&paths, &catalog.tables[0].indexes[0]);

    let mut summary = RunSummary {
        table_jobs: 2,
        index_jobs: 2,
        ..Default::default()
    };
    summary.collect(&paths, &catalog).unwrap();

    assert_eq!(summary.tables.len(), 2);
    assert_eq!(summary.tables[0].index_count, 1);
    assert_eq!(summary.tables[1].index_count, 0);

    let rendered = summary.render();
    assert!(rendered.contains("orders"));
    assert!(rendered.contains("events"));
}

#[test]
fn partitioned_table_needs_every_part_done() {
    let dir = TempDir::new().unwrap();
    let paths = CopyFilePaths::compute(Some(dir.path()), false).unwrap();
    init_workdir(&paths, false, false).unwrap();

    let parts: Vec<TablePart> = (0..4)
        .map(|part_number| TablePart {
            part_number,
            part_count: 4,
            min: i64::from(part_number) * 250 + 1,
            max: (i64::from(part_number) + 1) * 250,
        })
        .collect();
    let big = table(17000, "measurements", Vec::new(), parts);

    // Three of four parts done: the table does not count as complete.
    for part in 0..3 {
        finish_table(&paths, &big, Some(part));
    }
    let all_done = (0..4).all(|part| {
        paths.table_part_paths(big.oid, part).done_file.exists()
    });
    assert!(!all_done);

    finish_table(&paths, &big, Some(3));
    let all_done = (0..4).all(|part| {
        paths.table_part_paths(big.oid, part).done_file.exists()
    });
    assert!(all_done);
}

#[test]
fn interrupted_run_resumes_with_only_missing_steps() {
    let dir = TempDir::new().unwrap();
    let paths = CopyFilePaths::compute(Some(dir.path()), false).unwrap();
    init_workdir(&paths, false, false).unwrap();

    // Simulate the crash point of a run that dumped and restored the schema
    // and copied the tables, but died before the indexes.
    fs::write(&paths.done.pre_data_dump, b"").unwrap();
    fs::write(&paths.done.post_data_dump, b"").unwrap();
    fs::write(&paths.done.pre_data_restore, b"").unwrap();
    fs::write(&paths.done.tables, b"").unwrap();

    let state = inspect_workdir(&paths);
    assert!(state.schema_dump_done);
    assert!(state.pre_data_restored);
    assert!(state.tables_done);
    assert!(!state.indexes_done);
    assert!(!state.all_done);

    // Without --resume the run refuses to continue; with it, it proceeds.
    drop(fs::remove_file(&paths.pidfile));
    assert!(init_workdir(&paths, false, false).is_err());
    init_workdir(&paths, false, true).unwrap();
    assert!(paths.done.tables.exists());
}

#[test]
fn index_lists_round_trip_through_the_work_dir() {
    let dir = TempDir::new().unwrap();
    let paths = CopyFilePaths::compute(Some(dir.path()), false).unwrap();
    init_workdir(&paths, false, false).unwrap();

    let source_table = table(18000, "users", vec![index(21000, 0, 18000), index(21001, 21002, 18000)], Vec::new());
    let list_file = paths.table_paths(source_table.oid).idx_list_file;

    write_index_list(&list_file, &source_table.index_oid_pairs()).unwrap();
    let pairs = read_index_list(&list_file).unwrap();
    assert_eq!(pairs, vec![(21000, 0), (21001, 21002)]);
}
