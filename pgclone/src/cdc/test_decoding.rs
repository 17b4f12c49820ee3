//! Parser for the test_decoding output plugin.
//!
//! test_decoding emits one text line per change:
//!
//! ```text
//! BEGIN 529
//! table public.users: INSERT: id[integer]:1 name[text]:'ada'
//! table public.users: UPDATE: old-key: id[integer]:1 new-tuple: id[integer]:1 name[text]:'grace'
//! COMMIT 529 (at 2024-01-15 10:00:00.123456+00)
//! ```
//!
//! The receive process wraps each line in a JSON envelope carrying the
//! metadata; this module parses the raw line back into the shared message
//! model.

use crate::cdc::messages::{LogicalStatement, LogicalValue, StreamAction, TupleColumn};
use crate::error::{ErrorKind, Result};
use crate::pgclone_error;

/// Classifies a raw test_decoding line and extracts the xid when the line
/// carries one (only BEGIN and COMMIT do).
pub fn parse_action_and_xid(raw: &str) -> Result<(StreamAction, u32)> {
    if let Some(xid) = raw.strip_prefix("BEGIN ") {
        return Ok((StreamAction::Begin, parse_xid(xid)?));
    }
    if let Some(rest) = raw.strip_prefix("COMMIT ") {
        let xid = rest.split_whitespace().next().unwrap_or_default();
        return Ok((StreamAction::Commit, parse_xid(xid)?));
    }
    if raw.starts_with("table ") {
        let action = if raw.contains(": INSERT:") {
            StreamAction::Insert
        } else if raw.contains(": UPDATE:") {
            StreamAction::Update
        } else if raw.contains(": DELETE:") {
            StreamAction::Delete
        } else if raw.contains(": TRUNCATE:") {
            StreamAction::Truncate
        } else {
            return Err(unparseable(raw));
        };
        return Ok((action, 0));
    }
    if raw.starts_with("message:") {
        return Ok((StreamAction::Message, 0));
    }

    Err(unparseable(raw))
}

/// Parses a DML line into a replayable statement. BEGIN/COMMIT and logical
/// messages carry no statement.
pub fn parse_statement(raw: &str) -> Result<Option<LogicalStatement>> {
    let (action, _xid) = parse_action_and_xid(raw)?;

    let marker = match action {
        StreamAction::Insert => ": INSERT:",
        StreamAction::Update => ": UPDATE:",
        StreamAction::Delete => ": DELETE:",
        StreamAction::Truncate => ": TRUNCATE:",
        _ => return Ok(None),
    };

    let position = raw.find(marker).ok_or_else(|| unparseable(raw))?;
    let relation = &raw["table ".len()..position];
    let (nspname, relname) = split_relation(relation)?;
    let rest = raw[position + marker.len()..].trim();

    let statement = match action {
        StreamAction::Insert => LogicalStatement::Insert {
            nspname,
            relname,
            columns: parse_tuple(rest)?,
        },
        StreamAction::Update => {
            let (identity, set) = match rest.find("new-tuple:") {
                Some(split) => {
                    let old = rest[..split]
                        .trim()
                        .strip_prefix("old-key:")
                        .ok_or_else(|| unparseable(raw))?;
                    let new = &rest[split + "new-tuple:".len()..];
                    (parse_tuple(old.trim())?, parse_tuple(new.trim())?)
                }
                None => {
                    // Without REPLICA IDENTITY the old key never reaches the
                    // decoder and the statement cannot be replayed safely.
                    return Err(pgclone_error!(
                        ErrorKind::InvalidCdcMessage,
                        "update message carries no old key",
                        format!("set REPLICA IDENTITY on the table: {raw}")
                    ));
                }
            };
            LogicalStatement::Update {
                nspname,
                relname,
                set,
                identity,
            }
        }
        StreamAction::Delete => LogicalStatement::Delete {
            nspname,
            relname,
            identity: parse_tuple(rest)?,
        },
        StreamAction::Truncate => LogicalStatement::Truncate { nspname, relname },
        _ => unreachable!("filtered above"),
    };

    Ok(Some(statement))
}

/// Extracts the commit timestamp from `COMMIT 529 (at 2024-01-15 ...+00)`.
pub fn parse_commit_timestamp(raw: &str) -> Option<String> {
    let start = raw.find("(at ")?;
    let end = raw[start..].find(')')?;
    Some(raw[start + 4..start + end].to_string())
}

fn parse_xid(token: &str) -> Result<u32> {
    token
        .trim()
        .parse()
        .map_err(|_| pgclone_error!(ErrorKind::InvalidCdcMessage, "invalid xid", format!("{token:?}")))
}

fn unparseable(raw: &str) -> crate::error::Error {
    pgclone_error!(
        ErrorKind::InvalidCdcMessage,
        "unparseable test_decoding message",
        format!("{raw:?}")
    )
}

/// Splits `public.users` or `"My Schema"."My Table"` into its two parts.
fn split_relation(relation: &str) -> Result<(String, String)> {
    let split = find_relation_dot(relation).ok_or_else(|| unparseable(relation))?;
    let nspname = unquote_identifier(&relation[..split]);
    let relname = unquote_identifier(&relation[split + 1..]);
    Ok((nspname, relname))
}

/// Finds the separating dot, skipping dots inside double-quoted identifiers.
fn find_relation_dot(relation: &str) -> Option<usize> {
    let mut in_quotes = false;
    for (position, c) in relation.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '.' if !in_quotes => return Some(position),
            _ => {}
        }
    }
    None
}

fn unquote_identifier(identifier: &str) -> String {
    let trimmed = identifier.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        trimmed[1..trimmed.len() - 1].replace("\"\"", "\"")
    } else {
        trimmed.to_string()
    }
}

/// Parses a sequence of `name[type]:value` column descriptions.
fn parse_tuple(input: &str) -> Result<Vec<TupleColumn>> {
    let mut columns = Vec::new();
    let mut rest = input.trim_start();

    while !rest.is_empty() {
        let bracket = rest.find('[').ok_or_else(|| unparseable(rest))?;
        let name = rest[..bracket].to_string();

        let close = rest.find("]:").ok_or_else(|| unparseable(rest))?;
        let type_name = rest[bracket + 1..close].to_string();
        rest = &rest[close + 2..];

        let value = if rest.starts_with('\'') {
            let (text, consumed) = scan_quoted(rest)?;
            rest = rest[consumed..].trim_start();
            LogicalValue::Text(text)
        } else {
            let end = rest
                .find(char::is_whitespace)
                .unwrap_or(rest.len());
            let token = &rest[..end];
            let value = bare_value(&type_name, token);
            rest = rest[end..].trim_start();
            value
        };

        columns.push(TupleColumn { name, value });
    }

    Ok(columns)
}

/// Interprets an unquoted value token according to the declared type.
fn bare_value(type_name: &str, token: &str) -> LogicalValue {
    if token == "null" {
        return LogicalValue::Null;
    }

    match type_name {
        "boolean" => match token {
            "true" | "t" => LogicalValue::Bool(true),
            "false" | "f" => LogicalValue::Bool(false),
            other => LogicalValue::Verbatim(other.to_string()),
        },
        "smallint" | "integer" | "bigint" => token
            .parse::<i64>()
            .map(LogicalValue::Integer)
            .unwrap_or_else(|_| LogicalValue::Verbatim(token.to_string())),
        "real" | "double precision" => token
            .parse::<f64>()
            .map(LogicalValue::Float)
            .unwrap_or_else(|_| LogicalValue::Verbatim(token.to_string())),
        // numeric stays textual so no precision is lost; its token is
        // already a valid SQL literal.
        _ => LogicalValue::Verbatim(token.to_string()),
    }
}

/// Scans a `'quoted'` value with doubled-quote escapes; returns the
/// unescaped text and the bytes consumed including both quotes.
fn scan_quoted(input: &str) -> Result<(String, usize)> {
    debug_assert!(input.starts_with('\''));
    let mut text = String::new();
    let bytes = input.as_bytes();
    let mut position = 1;

    while position < bytes.len() {
        if bytes[position] == b'\'' {
            if bytes.get(position + 1) == Some(&b'\'') {
                text.push('\'');
                position += 2;
                continue;
            }
            return Ok((text, position + 1));
        }

        // Advance over one UTF-8 character.
        let c = input[position..].chars().next().ok_or_else(|| unparseable(input))?;
        text.push(c);
        position += c.len_utf8();
    }

    Err(pgclone_error!(
        ErrorKind::InvalidCdcMessage,
        "unterminated quoted value",
        format!("{input:?}")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_and_commit_carry_the_xid() {
        assert_eq!(
            parse_action_and_xid("BEGIN 529").unwrap(),
            (StreamAction::Begin, 529)
        );
        assert_eq!(
            parse_action_and_xid("COMMIT 529 (at 2024-01-15 10:00:00.123456+00)").unwrap(),
            (StreamAction::Commit, 529)
        );
    }

    #[test]
    fn commit_timestamp_is_extracted() {
        assert_eq!(
            parse_commit_timestamp("COMMIT 529 (at 2024-01-15 10:00:00.123456+00)").unwrap(),
            "2024-01-15 10:00:00.123456+00"
        );
        assert!(parse_commit_timestamp("COMMIT 529").is_none());
    }

    #[test]
    fn insert_line_parses_columns() {
        let raw = "table public.users: INSERT: id[integer]:1 name[text]:'ada' score[double precision]:1.25 active[boolean]:true bio[text]:null";
        let Some(LogicalStatement::Insert { nspname, relname, columns }) =
            parse_statement(raw).unwrap()
        else {
            panic!("expected insert");
        };

        assert_eq!((nspname.as_str(), relname.as_str()), ("public", "users"));
        assert_eq!(columns[0].value, LogicalValue::Integer(1));
        assert_eq!(columns[1].value, LogicalValue::Text("ada".into()));
        assert_eq!(columns[2].value, LogicalValue::Float(1.25));
        assert_eq!(columns[3].value, LogicalValue::Bool(true));
        assert_eq!(columns[4].value, LogicalValue::Null);
    }

    #[test]
    fn quoted_values_unescape_doubled_quotes() {
        let raw = "table public.notes: INSERT: body[text]:'it''s here'";
        let Some(LogicalStatement::Insert { columns, .. }) = parse_statement(raw).unwrap() else {
            panic!("expected insert");
        };
        assert_eq!(columns[0].value, LogicalValue::Text("it's here".into()));
    }

    #[test]
    fn update_splits_old_key_and_new_tuple() {
        let raw = "table public.users: UPDATE: old-key: id[integer]:1 new-tuple: id[integer]:1 name[text]:'grace'";
        let Some(LogicalStatement::Update { set, identity, .. }) =
            parse_statement(raw).unwrap()
        else {
            panic!("expected update");
        };
        assert_eq!(identity.len(), 1);
        assert_eq!(identity[0].name, "id");
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn update_without_old_key_is_a_data_error() {
        let raw = "table public.users: UPDATE: id[integer]:1 name[text]:'grace'";
        let err = parse_statement(raw).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidCdcMessage);
    }

    #[test]
    fn delete_parses_the_identity() {
        let raw = "table public.users: DELETE: id[integer]:1";
        let Some(LogicalStatement::Delete { identity, .. }) = parse_statement(raw).unwrap() else {
            panic!("expected delete");
        };
        assert_eq!(identity[0].value, LogicalValue::Integer(1));
    }

    #[test]
    fn truncate_has_no_tuple() {
        let raw = "table public.users: TRUNCATE: (no-flags)";
        let Some(LogicalStatement::Truncate { relname, .. }) = parse_statement(raw).unwrap() else {
            panic!("expected truncate");
        };
        assert_eq!(relname, "users");
    }

    #[test]
    fn quoted_relations_keep_their_dots() {
        let raw = r#"table "my.schema"."my table": DELETE: id[integer]:7"#;
        let Some(LogicalStatement::Delete { nspname, relname, .. }) =
            parse_statement(raw).unwrap()
        else {
            panic!("expected delete");
        };
        assert_eq!(nspname, "my.schema");
        assert_eq!(relname, "my table");
    }

    #[test]
    fn numeric_values_stay_verbatim() {
        let raw = "table public.ledger: INSERT: amount[numeric]:1234.5600";
        let Some(LogicalStatement::Insert { columns, .. }) = parse_statement(raw).unwrap() else {
            panic!("expected insert");
        };
        assert_eq!(columns[0].value, LogicalValue::Verbatim("1234.5600".into()));
    }
}
