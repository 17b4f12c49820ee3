//! Parser for the wal2json output plugin (format version 2).
//!
//! In format version 2 every change is its own JSON document with an
//! `action` field, which maps one to one onto the JSON-lines files the
//! receive process writes.

use serde_json::Value;

use crate::cdc::messages::{LogicalStatement, LogicalValue, MessageMetadata, StreamAction, TupleColumn};
use crate::error::{ErrorKind, Result};
use crate::pgclone_error;
use crate::pgsql::parse_lsn;

/// Extracts the message metadata from a wal2json document. The lsn and
/// timestamp may be absent on some actions; the caller fills those in from
/// the replication protocol header.
pub fn parse_metadata(json: &Value) -> Result<MessageMetadata> {
    let action = json
        .get("action")
        .and_then(Value::as_str)
        .and_then(|action| action.chars().next())
        .ok_or_else(|| {
            pgclone_error!(
                ErrorKind::InvalidCdcMessage,
                "wal2json message has no action",
                json
            )
        })?;

    let lsn = match json.get("lsn").and_then(Value::as_str) {
        Some(lsn) => parse_lsn(lsn)?,
        None => 0.into(),
    };

    Ok(MessageMetadata {
        action: StreamAction::from_char(action)?,
        xid: json.get("xid").and_then(Value::as_u64).unwrap_or(0) as u32,
        lsn,
        timestamp: json
            .get("timestamp")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

/// Parses a DML document into a replayable statement. Begin, commit and the
/// synthetic marker actions carry no statement and return `None`.
pub fn parse_statement(json: &Value) -> Result<Option<LogicalStatement>> {
    let metadata = parse_metadata(json)?;

    let statement = match metadata.action {
        StreamAction::Insert => LogicalStatement::Insert {
            nspname: table_field(json, "schema")?,
            relname: table_field(json, "table")?,
            columns: parse_columns(json.get("columns"))?,
        },
        StreamAction::Update => LogicalStatement::Update {
            nspname: table_field(json, "schema")?,
            relname: table_field(json, "table")?,
            set: parse_columns(json.get("columns"))?,
            identity: parse_columns(json.get("identity"))?,
        },
        StreamAction::Delete => LogicalStatement::Delete {
            nspname: table_field(json, "schema")?,
            relname: table_field(json, "table")?,
            identity: parse_columns(json.get("identity"))?,
        },
        StreamAction::Truncate => LogicalStatement::Truncate {
            nspname: table_field(json, "schema")?,
            relname: table_field(json, "table")?,
        },
        _ => return Ok(None),
    };

    Ok(Some(statement))
}

fn table_field(json: &Value, field: &'static str) -> Result<String> {
    json.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            pgclone_error!(
                ErrorKind::InvalidCdcMessage,
                "wal2json message is missing a relation field",
                format!("{field}: {json}")
            )
        })
}

fn parse_columns(columns: Option<&Value>) -> Result<Vec<TupleColumn>> {
    let Some(columns) = columns.and_then(Value::as_array) else {
        return Ok(Vec::new());
    };

    columns
        .iter()
        .map(|column| {
            let name = column
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    pgclone_error!(
                        ErrorKind::InvalidCdcMessage,
                        "wal2json column has no name",
                        column
                    )
                })?
                .to_string();
            let value = parse_value(column.get("value").unwrap_or(&Value::Null));
            Ok(TupleColumn { name, value })
        })
        .collect()
}

fn parse_value(value: &Value) -> LogicalValue {
    match value {
        Value::Null => LogicalValue::Null,
        Value::Bool(value) => LogicalValue::Bool(*value),
        Value::Number(number) => match number.as_i64() {
            Some(value) => LogicalValue::Integer(value),
            None => LogicalValue::Float(number.as_f64().unwrap_or(0.0)),
        },
        Value::String(value) => LogicalValue::Text(value.clone()),
        // Arrays and objects only show up for composite output options; the
        // decoder renders them as text before we ever see them, so reaching
        // this is a malformed stream. Render the raw JSON as quoted text.
        other => LogicalValue::Text(other.to_string()),
    }
}
