//! The transform stage: JSON-lines segment files to replayable SQL files.
//!
//! Transform is a pure function over file contents. Statements are collected
//! between BEGIN and COMMIT of the same xid into a transaction, and each
//! transaction is written as a `BEGIN; -- {json}` ... `COMMIT; -- {json}`
//! block whose metadata comments let the apply stage recover xid and LSN
//! from the SQL file alone. Keepalive and WAL-switch messages become comment
//! markers so progress travels with the files.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, info};

use crate::bail;
use crate::cdc::messages::{
    LogicalStatement, LogicalTransaction, MessageMetadata, StreamAction, TupleColumn,
};
use crate::cdc::{test_decoding, wal2json};
use crate::concurrency::queue::QueueReceiver;
use crate::error::{ErrorKind, Result};
use crate::pgsql::{parse_lsn, qualified_name};

/// Per-action counters accumulated over a transform run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamCounters {
    pub total: u64,
    pub begin: u64,
    pub commit: u64,
    pub insert: u64,
    pub update: u64,
    pub delete: u64,
    pub truncate: u64,
}

/// Long-lived transform worker fed by the receive process.
///
/// Files arrive strictly in LSN order, so a transaction left open at the end
/// of one file (it commits in a later segment) is carried over and written
/// into the file holding its COMMIT.
pub async fn transform_worker(queue: QueueReceiver<PathBuf>) -> Result<()> {
    let mut carry: Option<LogicalTransaction> = None;

    while let Some(json_file) = queue.recv().await {
        let sql_file = json_file.with_extension("sql");
        let counters = transform_file(&json_file, &sql_file, &mut carry)?;
        info!(
            file = %sql_file.display(),
            messages = counters.total,
            commits = counters.commit,
            "transformed segment"
        );
    }

    debug!("transform queue closed, worker exiting");
    Ok(())
}

/// Transforms one JSON-lines file into its SQL file. Idempotent over the
/// segment: the output is rewritten from scratch each time, through a
/// temporary file renamed into place so readers never observe a partial SQL
/// file.
pub fn transform_file(
    json_file: &Path,
    sql_file: &Path,
    carry: &mut Option<LogicalTransaction>,
) -> Result<StreamCounters> {
    let contents = fs::read_to_string(json_file)?;
    let partial_file = sql_file.with_extension("sql.partial");
    let mut writer = BufWriter::new(fs::File::create(&partial_file)?);
    let mut counters = StreamCounters::default();

    let mut current = carry.take();

    for line in contents.lines() {
        if line.is_empty() {
            continue;
        }

        let json: Value = serde_json::from_str(line)?;
        let metadata = metadata_from_line(&json)?;
        counters.total += 1;

        match metadata.action {
            StreamAction::Begin => {
                counters.begin += 1;
                if current.is_some() {
                    bail!(
                        ErrorKind::InvalidCdcMessage,
                        "nested BEGIN in the logical stream",
                        format!("xid {}", metadata.xid)
                    );
                }
                current = Some(LogicalTransaction::new(
                    metadata.xid,
                    metadata.lsn,
                    metadata.timestamp,
                ));
            }
            StreamAction::Commit => {
                counters.commit += 1;
                let Some(mut transaction) = current.take() else {
                    bail!(
                        ErrorKind::InvalidCdcMessage,
                        "COMMIT without a transaction in progress",
                        format!("xid {}", metadata.xid)
                    );
                };
                if transaction.xid != metadata.xid {
                    bail!(
                        ErrorKind::InvalidCdcMessage,
                        "COMMIT xid does not match the open transaction",
                        format!("open xid {}, commit xid {}", transaction.xid, metadata.xid)
                    );
                }
                transaction.commit_lsn = metadata.lsn;
                if !metadata.timestamp.is_empty() {
                    transaction.timestamp = metadata.timestamp;
                }
                write_transaction(&mut writer, &transaction)?;
            }
            StreamAction::Insert
            | StreamAction::Update
            | StreamAction::Delete
            | StreamAction::Truncate => {
                match metadata.action {
                    StreamAction::Insert => counters.insert += 1,
                    StreamAction::Update => counters.update += 1,
                    StreamAction::Delete => counters.delete += 1,
                    StreamAction::Truncate => counters.truncate += 1,
                    _ => {}
                }
                let Some(statement) = statement_from_line(&json)? else {
                    continue;
                };
                let Some(transaction) = current.as_mut() else {
                    bail!(
                        ErrorKind::InvalidCdcMessage,
                        "data message outside of a transaction",
                        format!("xid {}", metadata.xid)
                    );
                };
                transaction.append(statement);
            }
            StreamAction::SwitchWal => match current.as_mut() {
                Some(transaction) => {
                    transaction.append(LogicalStatement::SwitchWal { lsn: metadata.lsn });
                }
                None => writeln!(writer, "-- SWITCH WAL {}", metadata.lsn)?,
            },
            StreamAction::Keepalive => match current.as_mut() {
                Some(transaction) => transaction.append(LogicalStatement::Keepalive {
                    lsn: metadata.lsn,
                    timestamp: metadata.timestamp,
                }),
                None => {
                    writeln!(writer, "-- KEEPALIVE {} {}", metadata.lsn, metadata.timestamp)?;
                }
            },
            StreamAction::Message => {
                // Logical messages carry no replayable content.
            }
        }
    }

    writer.flush()?;
    writer.into_inner().map_err(|err| err.into_error())?.sync_all()?;
    fs::rename(&partial_file, sql_file)?;
    *carry = current;

    Ok(counters)
}

/// Extracts the metadata envelope every JSON line carries, for both plugin
/// formats.
pub fn metadata_from_line(json: &Value) -> Result<MessageMetadata> {
    wal2json::parse_metadata(json)
}

/// Parses the plugin-specific payload of a line: lines carrying a raw
/// `message` field come from test_decoding, everything else is wal2json.
pub fn statement_from_line(json: &Value) -> Result<Option<LogicalStatement>> {
    match json.get("message").and_then(Value::as_str) {
        Some(raw) => test_decoding::parse_statement(raw),
        None => wal2json::parse_statement(json),
    }
}

fn write_transaction<W: Write>(writer: &mut W, transaction: &LogicalTransaction) -> Result<()> {
    writeln!(
        writer,
        "BEGIN; -- {{\"xid\": {}, \"lsn\": \"{}\", \"timestamp\": \"{}\"}}",
        transaction.xid, transaction.begin_lsn, transaction.timestamp
    )?;

    for statement in &transaction.statements {
        match statement {
            LogicalStatement::SwitchWal { lsn } => writeln!(writer, "-- SWITCH WAL {lsn}")?,
            LogicalStatement::Keepalive { lsn, timestamp } => {
                writeln!(writer, "-- KEEPALIVE {lsn} {timestamp}")?;
            }
            other => writeln!(writer, "{}", render_statement(other))?,
        }
    }

    writeln!(
        writer,
        "COMMIT; -- {{\"xid\": {}, \"lsn\": \"{}\"}}",
        transaction.xid, transaction.commit_lsn
    )?;

    Ok(())
}

/// Renders one DML statement as SQL.
pub fn render_statement(statement: &LogicalStatement) -> String {
    match statement {
        LogicalStatement::Insert {
            nspname,
            relname,
            columns,
        } => {
            let names: Vec<String> = columns
                .iter()
                .map(|column| pg_escape::quote_identifier(&column.name).to_string())
                .collect();
            let values: Vec<String> =
                columns.iter().map(|column| column.value.render()).collect();
            format!(
                "INSERT INTO {} ({}) VALUES ({});",
                qualified_name(nspname, relname),
                names.join(", "),
                values.join(", ")
            )
        }
        LogicalStatement::Update {
            nspname,
            relname,
            set,
            identity,
        } => {
            let assignments: Vec<String> = set
                .iter()
                .map(|column| {
                    format!(
                        "{} = {}",
                        pg_escape::quote_identifier(&column.name),
                        column.value.render()
                    )
                })
                .collect();
            format!(
                "UPDATE {} SET {} WHERE {};",
                qualified_name(nspname, relname),
                assignments.join(", "),
                render_where(identity)
            )
        }
        LogicalStatement::Delete {
            nspname,
            relname,
            identity,
        } => format!(
            "DELETE FROM {} WHERE {};",
            qualified_name(nspname, relname),
            render_where(identity)
        ),
        LogicalStatement::Truncate { nspname, relname } => {
            format!("TRUNCATE {};", qualified_name(nspname, relname))
        }
        LogicalStatement::SwitchWal { lsn } => format!("-- SWITCH WAL {lsn}"),
        LogicalStatement::Keepalive { lsn, timestamp } => {
            format!("-- KEEPALIVE {lsn} {timestamp}")
        }
    }
}

fn render_where(identity: &[TupleColumn]) -> String {
    identity
        .iter()
        .map(|column| {
            let name = pg_escape::quote_identifier(&column.name);
            match column.value {
                crate::cdc::messages::LogicalValue::Null => format!("{name} IS NULL"),
                _ => format!("{name} = {}", column.value.render()),
            }
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Recovers the metadata of a `BEGIN; -- {...}` or `COMMIT; -- {...}` line,
/// and classifies the marker comments; used by the apply parser.
pub fn parse_sql_marker(line: &str) -> Result<Option<(StreamAction, MessageMetadata)>> {
    if let Some(json) = line.strip_prefix("BEGIN; -- ") {
        let metadata = marker_metadata(StreamAction::Begin, json)?;
        return Ok(Some((StreamAction::Begin, metadata)));
    }
    if let Some(json) = line.strip_prefix("COMMIT; -- ") {
        let metadata = marker_metadata(StreamAction::Commit, json)?;
        return Ok(Some((StreamAction::Commit, metadata)));
    }
    if let Some(rest) = line.strip_prefix("-- SWITCH WAL ") {
        return Ok(Some((
            StreamAction::SwitchWal,
            MessageMetadata {
                action: StreamAction::SwitchWal,
                xid: 0,
                lsn: parse_lsn(rest.trim())?,
                timestamp: String::new(),
            },
        )));
    }
    if let Some(rest) = line.strip_prefix("-- KEEPALIVE ") {
        let mut parts = rest.trim().splitn(2, ' ');
        let lsn = parse_lsn(parts.next().unwrap_or_default())?;
        return Ok(Some((
            StreamAction::Keepalive,
            MessageMetadata {
                action: StreamAction::Keepalive,
                xid: 0,
                lsn,
                timestamp: parts.next().unwrap_or_default().to_string(),
            },
        )));
    }

    Ok(None)
}

fn marker_metadata(action: StreamAction, json: &str) -> Result<MessageMetadata> {
    let value: Value = serde_json::from_str(json)?;
    let lsn = value
        .get("lsn")
        .and_then(Value::as_str)
        .map(parse_lsn)
        .transpose()?
        .unwrap_or_else(|| 0.into());

    Ok(MessageMetadata {
        action,
        xid: value.get("xid").and_then(Value::as_u64).unwrap_or(0) as u32,
        lsn,
        timestamp: value
            .get("timestamp")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdc::messages::LogicalValue;
    use tempfile::TempDir;

    fn transform_lines(lines: &[&str]) -> (String, StreamCounters) {
        let dir = TempDir::new().unwrap();
        let json_file = dir.path().join("seg.json");
        let sql_file = dir.path().join("seg.sql");
        fs::write(&json_file, lines.join("\n")).unwrap();

        let mut carry = None;
        let counters = transform_file(&json_file, &sql_file, &mut carry).unwrap();
        assert!(carry.is_none());
        (fs::read_to_string(&sql_file).unwrap(), counters)
    }

    #[test]
    fn wal2json_transaction_renders_with_metadata_comments() {
        let (sql, counters) = transform_lines(&[
            r#"{"action":"B","xid":529,"lsn":"0/1949710","timestamp":"2024-01-15 10:00:00+00"}"#,
            r#"{"action":"I","xid":529,"lsn":"0/1949790","schema":"public","table":"users","columns":[{"name":"id","type":"integer","value":1},{"name":"name","type":"text","value":"ada"}]}"#,
            r#"{"action":"C","xid":529,"lsn":"0/1949CC8","timestamp":"2024-01-15 10:00:01+00"}"#,
        ]);

        assert_eq!(counters.begin, 1);
        assert_eq!(counters.insert, 1);
        assert_eq!(counters.commit, 1);

        let expected = "\
BEGIN; -- {\"xid\": 529, \"lsn\": \"0/1949710\", \"timestamp\": \"2024-01-15 10:00:01+00\"}
INSERT INTO public.users (id, name) VALUES (1, 'ada');
COMMIT; -- {\"xid\": 529, \"lsn\": \"0/1949CC8\"}
";
        assert_eq!(sql, expected);
    }

    #[test]
    fn test_decoding_lines_render_the_same_sql() {
        let (sql, _) = transform_lines(&[
            r#"{"action":"B","xid":530,"lsn":"0/1A00010","timestamp":""}"#,
            r#"{"action":"U","xid":530,"lsn":"0/1A00020","timestamp":"","message":"table public.users: UPDATE: old-key: id[integer]:1 new-tuple: id[integer]:1 name[text]:'grace'"}"#,
            r#"{"action":"C","xid":530,"lsn":"0/1A00100","timestamp":""}"#,
        ]);

        assert!(sql.contains(
            "UPDATE public.users SET id = 1, name = 'grace' WHERE id = 1;"
        ));
    }

    #[test]
    fn markers_outside_transactions_are_standalone_comments() {
        let (sql, _) = transform_lines(&[
            r#"{"action":"K","xid":0,"lsn":"0/1B00000","timestamp":"2024-01-15 10:05:00+00"}"#,
            r#"{"action":"X","xid":0,"lsn":"0/2000000","timestamp":""}"#,
        ]);

        assert_eq!(
            sql,
            "-- KEEPALIVE 0/1B00000 2024-01-15 10:05:00+00\n-- SWITCH WAL 0/2000000\n"
        );
    }

    #[test]
    fn open_transaction_carries_over_to_the_next_file() {
        let dir = TempDir::new().unwrap();
        let first_json = dir.path().join("a.json");
        let second_json = dir.path().join("b.json");
        fs::write(
            &first_json,
            r#"{"action":"B","xid":7,"lsn":"0/100","timestamp":""}
{"action":"D","xid":7,"lsn":"0/110","timestamp":"","schema":"public","table":"t","identity":[{"name":"id","type":"integer","value":3}]}"#,
        )
        .unwrap();
        fs::write(
            &second_json,
            r#"{"action":"C","xid":7,"lsn":"0/200","timestamp":""}"#,
        )
        .unwrap();

        let mut carry = None;
        let first_sql = dir.path().join("a.sql");
        transform_file(&first_json, &first_sql, &mut carry).unwrap();
        assert!(carry.is_some());
        assert_eq!(fs::read_to_string(&first_sql).unwrap(), "");

        let second_sql = dir.path().join("b.sql");
        transform_file(&second_json, &second_sql, &mut carry).unwrap();
        assert!(carry.is_none());
        let sql = fs::read_to_string(&second_sql).unwrap();
        assert!(sql.contains("DELETE FROM public.t WHERE id = 3;"));
        assert!(sql.ends_with("COMMIT; -- {\"xid\": 7, \"lsn\": \"0/200\"}\n"));
    }

    #[test]
    fn commit_without_begin_is_rejected() {
        let dir = TempDir::new().unwrap();
        let json_file = dir.path().join("bad.json");
        fs::write(&json_file, r#"{"action":"C","xid":9,"lsn":"0/100","timestamp":""}"#).unwrap();

        let mut carry = None;
        let err = transform_file(&json_file, &dir.path().join("bad.sql"), &mut carry).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidCdcMessage);
    }

    #[test]
    fn null_identity_uses_is_null() {
        let statement = LogicalStatement::Delete {
            nspname: "public".into(),
            relname: "t".into(),
            identity: vec![TupleColumn {
                name: "id".into(),
                value: LogicalValue::Null,
            }],
        };
        assert_eq!(
            render_statement(&statement),
            "DELETE FROM public.t WHERE id IS NULL;"
        );
    }

    #[test]
    fn sql_markers_round_trip() {
        let (action, metadata) =
            parse_sql_marker("BEGIN; -- {\"xid\": 529, \"lsn\": \"0/1949710\", \"timestamp\": \"t\"}")
                .unwrap()
                .unwrap();
        assert_eq!(action, StreamAction::Begin);
        assert_eq!(metadata.xid, 529);
        assert_eq!(u64::from(metadata.lsn), 0x1949710);

        let (action, metadata) = parse_sql_marker("COMMIT; -- {\"xid\": 529, \"lsn\": \"0/1949CC8\"}")
            .unwrap()
            .unwrap();
        assert_eq!(action, StreamAction::Commit);
        assert_eq!(u64::from(metadata.lsn), 0x1949CC8);

        let (action, metadata) = parse_sql_marker("-- KEEPALIVE 0/1B00000 2024-01-15").unwrap().unwrap();
        assert_eq!(action, StreamAction::Keepalive);
        assert_eq!(metadata.timestamp, "2024-01-15");

        assert!(parse_sql_marker("INSERT INTO t VALUES (1);").unwrap().is_none());
    }
}
