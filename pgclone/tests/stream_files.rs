//! The CDC file pipeline end to end, without a database: decoded messages
//! become JSON lines, JSON lines become SQL files, and SQL files parse back
//! into transactions with the metadata apply needs for crash-safe replay.

use std::fs;

use pgclone::cdc::OutputPlugin;
use pgclone::cdc::apply::{ApplyEntry, parse_sql_file};
use pgclone::cdc::receive::prepare_json_line;
use pgclone::cdc::transform::transform_file;
use pgclone::pgsql::parse_lsn;
use tempfile::TempDir;
use tokio_postgres::types::PgLsn;

/// Feeds a scripted test_decoding session through the receive-side encoder
/// and returns the JSON lines as they would land in a segment file.
fn encode_session(messages: &[(&str, &str)]) -> Vec<String> {
    let mut xid = 0;
    messages
        .iter()
        .map(|(lsn, payload)| {
            let (_, line) = prepare_json_line(
                OutputPlugin::TestDecoding,
                payload,
                parse_lsn(lsn).unwrap(),
                &mut xid,
            )
            .unwrap();
            line
        })
        .collect()
}

#[test]
fn two_transactions_replay_in_commit_order() {
    let lines = encode_session(&[
        ("0/1000", "BEGIN 529"),
        ("0/1010", "table public.users: INSERT: id[integer]:1 name[text]:'ada'"),
        ("0/1080", "COMMIT 529 (at 2024-01-15 10:00:00.123456+00)"),
        ("0/2000", "BEGIN 530"),
        (
            "0/2010",
            "table public.users: UPDATE: old-key: id[integer]:1 new-tuple: id[integer]:1 name[text]:'grace'",
        ),
        ("0/2080", "COMMIT 530 (at 2024-01-15 10:00:02.000000+00)"),
    ]);

    let dir = TempDir::new().unwrap();
    let json_file = dir.path().join("seg.json");
    let sql_file = dir.path().join("seg.sql");
    fs::write(&json_file, lines.join("\n")).unwrap();

    let mut carry = None;
    let counters = transform_file(&json_file, &sql_file, &mut carry).unwrap();
    assert_eq!(counters.commit, 2);

    let entries = parse_sql_file(&sql_file).unwrap();
    let transactions: Vec<_> = entries
        .iter()
        .filter_map(|entry| match entry {
            ApplyEntry::Transaction(transaction) => Some(transaction),
            _ => None,
        })
        .collect();

    assert_eq!(transactions.len(), 2);
    assert_eq!(transactions[0].xid, 529);
    assert_eq!(transactions[1].xid, 530);
    assert!(transactions[0].commit_lsn < transactions[1].commit_lsn);
    assert_eq!(
        transactions[0].statements,
        vec!["INSERT INTO public.users (id, name) VALUES (1, 'ada');".to_string()]
    );
    assert_eq!(
        transactions[1].statements,
        vec!["UPDATE public.users SET id = 1, name = 'grace' WHERE id = 1;".to_string()]
    );

    // Crash between the two: the origin sits at the first commit, so only
    // the second transaction is new on replay.
    let origin = transactions[0].commit_lsn;
    let unapplied: Vec<_> = transactions
        .iter()
        .filter(|transaction| transaction.commit_lsn > origin)
        .collect();
    assert_eq!(unapplied.len(), 1);
    assert_eq!(unapplied[0].xid, 530);
}

#[test]
fn keepalives_and_switches_travel_with_the_files() {
    let lines = encode_session(&[
        ("0/1000", "BEGIN 7"),
        ("0/1010", "table public.t: DELETE: id[integer]:3"),
        ("0/1080", "COMMIT 7 (at 2024-01-15 11:00:00+00)"),
    ]);

    let dir = TempDir::new().unwrap();
    let json_file = dir.path().join("seg.json");
    let sql_file = dir.path().join("seg.sql");

    // A keepalive after the transaction, as the receive process writes them.
    let keepalive = r#"{"action":"K","xid":0,"lsn":"0/1FF0","timestamp":"2024-01-15 11:00:05+00"}"#;
    let switch = r#"{"action":"X","xid":0,"lsn":"0/2000000","timestamp":""}"#;
    let mut contents = lines.join("\n");
    contents.push('\n');
    contents.push_str(keepalive);
    contents.push('\n');
    contents.push_str(switch);
    fs::write(&json_file, contents).unwrap();

    let mut carry = None;
    transform_file(&json_file, &sql_file, &mut carry).unwrap();

    let entries = parse_sql_file(&sql_file).unwrap();
    assert_eq!(entries.len(), 3);
    assert!(matches!(entries[0], ApplyEntry::Transaction(_)));
    assert!(matches!(entries[1], ApplyEntry::Keepalive { .. }));
    let ApplyEntry::SwitchWal { lsn } = entries[2] else {
        panic!("expected a wal switch last");
    };
    assert_eq!(lsn, PgLsn::from(0x2000000u64));
}

#[test]
fn wal2json_and_test_decoding_converge_on_the_same_sql() {
    let dir = TempDir::new().unwrap();

    let wal2json_lines = [
        r#"{"action":"B","xid":42,"lsn":"0/3000","timestamp":"2024-02-01 09:00:00+00"}"#.to_string(),
        r#"{"action":"I","xid":42,"lsn":"0/3010","schema":"public","table":"t","columns":[{"name":"id","type":"integer","value":9},{"name":"ok","type":"boolean","value":false}]}"#.to_string(),
        r#"{"action":"C","xid":42,"lsn":"0/3080","timestamp":"2024-02-01 09:00:00+00"}"#.to_string(),
    ];

    let test_decoding_lines = encode_session(&[
        ("0/3000", "BEGIN 42"),
        ("0/3010", "table public.t: INSERT: id[integer]:9 ok[boolean]:false"),
        ("0/3080", "COMMIT 42 (at 2024-02-01 09:00:00+00)"),
    ]);

    let mut outputs = Vec::new();
    for (name, lines) in [("w2j", wal2json_lines.to_vec()), ("td", test_decoding_lines)] {
        let json_file = dir.path().join(format!("{name}.json"));
        let sql_file = dir.path().join(format!("{name}.sql"));
        fs::write(&json_file, lines.join("\n")).unwrap();
        let mut carry = None;
        transform_file(&json_file, &sql_file, &mut carry).unwrap();
        outputs.push(fs::read_to_string(&sql_file).unwrap());
    }

    let statement = "INSERT INTO public.t (id, ok) VALUES (9, false);";
    assert!(outputs[0].contains(statement));
    assert!(outputs[1].contains(statement));
}

#[test]
fn transform_is_idempotent_over_a_segment() {
    let lines = encode_session(&[
        ("0/1000", "BEGIN 99"),
        ("0/1010", "table public.t: TRUNCATE: (no-flags)"),
        ("0/1080", "COMMIT 99 (at 2024-03-01 00:00:00+00)"),
    ]);

    let dir = TempDir::new().unwrap();
    let json_file = dir.path().join("seg.json");
    let sql_file = dir.path().join("seg.sql");
    fs::write(&json_file, lines.join("\n")).unwrap();

    let mut carry = None;
    transform_file(&json_file, &sql_file, &mut carry).unwrap();
    let first = fs::read_to_string(&sql_file).unwrap();

    let mut carry = None;
    transform_file(&json_file, &sql_file, &mut carry).unwrap();
    let second = fs::read_to_string(&sql_file).unwrap();

    assert_eq!(first, second);
    assert!(first.contains("TRUNCATE public.t;"));
}
