//! End-of-run reporting.
//!
//! Every long-running phase is timed; per-table and per-index durations are
//! read back from the done files rather than kept in memory, so a resumed
//! run reports the durations of the runs that actually did the work.

use std::time::Instant;

use crate::catalog::SourceCatalog;
use crate::error::Result;
use crate::summary::{BlobsSummary, IndexSummary, TableSummary, read_index_list};
use crate::workdir::CopyFilePaths;

/// Milliseconds elapsed since a starting point, for the step ledger.
pub struct StepTimer(Instant);

impl StepTimer {
    pub fn start() -> Self {
        StepTimer(Instant::now())
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.0.elapsed().as_millis() as u64
    }
}

/// Wall-clock durations of the sequential steps and cumulative durations of
/// the parallel ones.
#[derive(Debug, Clone, Copy, Default)]
pub struct TopLevelTimings {
    pub dump_schema_ms: u64,
    pub fetch_schema_ms: u64,
    pub prepare_schema_ms: u64,
    /// Wall clock of the whole parallel phase: COPY, blobs, indexes, vacuum.
    pub data_and_indexes_ms: u64,
    pub finalize_schema_ms: u64,
    pub total_ms: u64,
    /// Cumulative COPY time across workers, from the table done files.
    pub table_ms: u64,
    /// Cumulative index and constraint time, from the index done files.
    pub index_ms: u64,
    pub blobs_ms: u64,
}

/// One row of the per-table summary table.
#[derive(Debug, Clone)]
pub struct TableReportEntry {
    pub oid: u32,
    pub nspname: String,
    pub relname: String,
    pub table_ms: u64,
    pub index_count: usize,
    pub index_ms: u64,
}

/// The final report handed back to the caller.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub timings: TopLevelTimings,
    pub tables: Vec<TableReportEntry>,
    pub table_jobs: usize,
    pub index_jobs: usize,
}

impl RunSummary {
    /// Scans the work directory for the per-table and per-index done files
    /// and fills in the table entries and cumulative durations.
    pub fn collect(
        &mut self,
        paths: &CopyFilePaths,
        catalog: &SourceCatalog,
    ) -> Result<()> {
        for table in &catalog.tables {
            let mut entry = TableReportEntry {
                oid: table.oid,
                nspname: table.nspname.clone(),
                relname: table.relname.clone(),
                table_ms: 0,
                index_count: 0,
                index_ms: 0,
            };

            if table.is_partitioned() {
                for part in &table.parts {
                    let done = paths
                        .table_part_paths(table.oid, part.part_number)
                        .done_file;
                    if done.exists() {
                        entry.table_ms += TableSummary::read(&done)?.duration_ms;
                    }
                }
            } else {
                let done = paths.table_paths(table.oid).done_file;
                if done.exists() {
                    entry.table_ms = TableSummary::read(&done)?.duration_ms;
                }
            }

            let indexes = read_index_list(&paths.table_paths(table.oid).idx_list_file)?;
            entry.index_count = indexes.len();
            for (index_oid, _constraint_oid) in indexes {
                let index_paths = paths.index_paths(index_oid);
                if index_paths.done_file.exists() {
                    entry.index_ms += IndexSummary::read(&index_paths.done_file)?.duration_ms;
                }
                if index_paths.constraint_done_file.exists() {
                    entry.index_ms +=
                        IndexSummary::read(&index_paths.constraint_done_file)?.duration_ms;
                }
            }

            self.timings.table_ms += entry.table_ms;
            self.timings.index_ms += entry.index_ms;
            self.tables.push(entry);
        }

        if paths.done.blobs.exists() {
            self.timings.blobs_ms = BlobsSummary::read(&paths.done.blobs)?.duration_ms;
        }

        Ok(())
    }

    /// Renders the per-table summary table and the step ledger.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.render_table());
        out.push('\n');
        out.push_str(&self.render_steps());
        out
    }

    fn render_table(&self) -> String {
        let headers = ["OID", "Schema", "Name", "copy duration", "indexes", "create index duration"];

        let rows: Vec<[String; 6]> = self
            .tables
            .iter()
            .map(|entry| {
                [
                    entry.oid.to_string(),
                    entry.nspname.clone(),
                    entry.relname.clone(),
                    format_interval_ms(entry.table_ms),
                    entry.index_count.to_string(),
                    format_interval_ms(entry.index_ms),
                ]
            })
            .collect();

        let mut widths: [usize; 6] = headers.map(str::len);
        for row in &rows {
            for (width, cell) in widths.iter_mut().zip(row.iter()) {
                *width = (*width).max(cell.len());
            }
        }

        let render_row = |cells: &[&str]| -> String {
            let mut line = String::new();
            for (i, cell) in cells.iter().enumerate() {
                if i > 0 {
                    line.push_str(" | ");
                }
                let width = widths[i];
                line.push_str(&format!("{cell:>width$}"));
            }
            line.push('\n');
            line
        };

        let mut out = String::new();
        out.push('\n');
        out.push_str(&render_row(&headers));
        let separator: Vec<String> = widths.iter().map(|width| "-".repeat(*width)).collect();
        out.push_str(
            &separator
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join("-+-"),
        );
        out.push('\n');
        for row in &rows {
            let cells: Vec<&str> = row.iter().map(String::as_str).collect();
            out.push_str(&render_row(&cells));
        }

        out
    }

    fn render_steps(&self) -> String {
        let concurrency = format!("{} + {}", self.table_jobs, self.table_jobs + self.index_jobs);

        let steps: Vec<(&str, &str, String, String)> = vec![
            ("Dump Schema", "source", format_interval_ms(self.timings.dump_schema_ms), "1".into()),
            (
                "Catalog Queries (table ordering, partitioning)",
                "source",
                format_interval_ms(self.timings.fetch_schema_ms),
                "1".into(),
            ),
            ("Prepare Schema", "target", format_interval_ms(self.timings.prepare_schema_ms), "1".into()),
            (
                "COPY, INDEX, CONSTRAINTS, VACUUM (wall clock)",
                "both",
                format_interval_ms(self.timings.data_and_indexes_ms),
                concurrency.clone(),
            ),
            ("COPY (cumulative)", "both", format_interval_ms(self.timings.table_ms), self.table_jobs.to_string()),
            ("Large Objects (cumulative)", "both", format_interval_ms(self.timings.blobs_ms), "1".into()),
            (
                "CREATE INDEX, CONSTRAINTS (cumulative)",
                "target",
                format_interval_ms(self.timings.index_ms),
                self.index_jobs.to_string(),
            ),
            ("Finalize Schema", "target", format_interval_ms(self.timings.finalize_schema_ms), "1".into()),
            ("Total Wall Clock Duration", "both", format_interval_ms(self.timings.total_ms), concurrency),
        ];

        let mut out = String::new();
        out.push_str(&format!(
            " {:<48}   {:>10}  {:>10}  {:>12}\n",
            "Step", "Connection", "Duration", "Concurrency"
        ));
        out.push_str(&format!(
            " {:-<48}   {:->10}  {:->10}  {:->12}\n",
            "", "", "", ""
        ));
        for (step, connection, duration, concurrency) in steps {
            out.push_str(&format!(
                " {step:<48}   {connection:>10}  {duration:>10}  {concurrency:>12}\n"
            ));
        }

        out
    }
}

/// Renders a duration in the compact form used across the reports.
pub fn format_interval_ms(ms: u64) -> String {
    if ms < 1_000 {
        format!("{ms}ms")
    } else if ms < 60_000 {
        format!("{}.{:03}s", ms / 1_000, ms % 1_000)
    } else if ms < 3_600_000 {
        format!("{}m{:02}s", ms / 60_000, (ms % 60_000) / 1_000)
    } else {
        format!("{}h{:02}m", ms / 3_600_000, (ms % 3_600_000) / 60_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intervals_render_compactly() {
        assert_eq!(format_interval_ms(0), "0ms");
        assert_eq!(format_interval_ms(999), "999ms");
        assert_eq!(format_interval_ms(12_345), "12.345s");
        assert_eq!(format_interval_ms(83_000), "1m23s");
        assert_eq!(format_interval_ms(2 * 3_600_000 + 5 * 60_000), "2h05m");
    }

    #[test]
    fn summary_table_aligns_columns() {
        let summary = RunSummary {
            tables: vec![
                TableReportEntry {
                    oid: 16384,
                    nspname: "public".into(),
                    relname: "orders".into(),
                    table_ms: 1_500,
                    index_count: 2,
                    index_ms: 300,
                },
                TableReportEntry {
                    oid: 16999,
                    nspname: "audit".into(),
                    relname: "events_with_a_long_name".into(),
                    table_ms: 12,
                    index_count: 0,
                    index_ms: 0,
                },
            ],
            table_jobs: 4,
            index_jobs: 2,
            ..Default::default()
        };

        let rendered = summary.render();
        assert!(rendered.contains("events_with_a_long_name"));
        assert!(rendered.contains("1.500s"));
        assert!(rendered.contains("Total Wall Clock Duration"));

        // Every table row has the same width as the header row.
        let lines: Vec<&str> = rendered.lines().filter(|l| l.contains(" | ")).collect();
        let widths: Vec<usize> = lines.iter().map(|l| l.len()).collect();
        assert!(widths.windows(2).all(|pair| pair[0] == pair[1]));
    }
}
