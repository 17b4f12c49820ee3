//! Logical decoding message model.
//!
//! One sum type covers every action the decoders emit; the per-plugin
//! parsers in [`crate::cdc::wal2json`] and [`crate::cdc::test_decoding`]
//! both produce these types, so everything downstream of receive is
//! plugin-agnostic.

use serde::{Deserialize, Serialize};
use tokio_postgres::types::PgLsn;

use crate::error::{ErrorKind, Result};
use crate::pgclone_error;

/// The action of one logical decoding message, in stream order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamAction {
    #[serde(rename = "B")]
    Begin,
    #[serde(rename = "C")]
    Commit,
    #[serde(rename = "I")]
    Insert,
    #[serde(rename = "U")]
    Update,
    #[serde(rename = "D")]
    Delete,
    #[serde(rename = "T")]
    Truncate,
    #[serde(rename = "M")]
    Message,
    #[serde(rename = "X")]
    SwitchWal,
    #[serde(rename = "K")]
    Keepalive,
}

impl StreamAction {
    pub fn from_char(action: char) -> Result<Self> {
        Ok(match action {
            'B' => StreamAction::Begin,
            'C' => StreamAction::Commit,
            'I' => StreamAction::Insert,
            'U' => StreamAction::Update,
            'D' => StreamAction::Delete,
            'T' => StreamAction::Truncate,
            'M' => StreamAction::Message,
            'X' => StreamAction::SwitchWal,
            'K' => StreamAction::Keepalive,
            other => {
                return Err(pgclone_error!(
                    ErrorKind::InvalidCdcMessage,
                    "unknown stream action",
                    other
                ));
            }
        })
    }
}

/// Metadata shared by every message: what happened, in which transaction,
/// where in the WAL, and when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMetadata {
    pub action: StreamAction,
    pub xid: u32,
    pub lsn: PgLsn,
    pub timestamp: String,
}

/// A decoded column value.
///
/// The decoders only distinguish the scalar types; everything else arrives
/// as text. `Verbatim` carries literals that are already valid SQL (numerics
/// and pre-quoted values) and render without further quoting.
#[derive(Debug, Clone, PartialEq)]
pub enum LogicalValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Verbatim(String),
}

impl LogicalValue {
    /// Renders the value as a SQL literal.
    pub fn render(&self) -> String {
        match self {
            LogicalValue::Null => "NULL".to_string(),
            LogicalValue::Bool(true) => "true".to_string(),
            LogicalValue::Bool(false) => "false".to_string(),
            LogicalValue::Integer(value) => value.to_string(),
            // The default float formatting round-trips f64.
            LogicalValue::Float(value) => value.to_string(),
            LogicalValue::Text(value) => quote_text(value),
            LogicalValue::Verbatim(value) => value.clone(),
        }
    }
}

/// Quotes a text value as a SQL literal. Values with control characters use
/// the escape-string form so the generated statement stays on one line,
/// which the SQL file parser depends on.
fn quote_text(value: &str) -> String {
    if value.contains('\n') || value.contains('\r') || value.contains('\t') {
        let escaped = value
            .replace('\\', "\\\\")
            .replace('\'', "''")
            .replace('\n', "\\n")
            .replace('\r', "\\r")
            .replace('\t', "\\t");
        format!("E'{escaped}'")
    } else {
        pg_escape::quote_literal(value).to_string()
    }
}

/// One column of a decoded tuple.
#[derive(Debug, Clone, PartialEq)]
pub struct TupleColumn {
    pub name: String,
    pub value: LogicalValue,
}

/// A replayable statement inside a transaction, or one of the two stream
/// markers that travel between transactions.
#[derive(Debug, Clone, PartialEq)]
pub enum LogicalStatement {
    Insert {
        nspname: String,
        relname: String,
        columns: Vec<TupleColumn>,
    },
    Update {
        nspname: String,
        relname: String,
        set: Vec<TupleColumn>,
        identity: Vec<TupleColumn>,
    },
    Delete {
        nspname: String,
        relname: String,
        identity: Vec<TupleColumn>,
    },
    Truncate {
        nspname: String,
        relname: String,
    },
    SwitchWal {
        lsn: PgLsn,
    },
    Keepalive {
        lsn: PgLsn,
        timestamp: String,
    },
}

/// An ordered list of statements bracketed by BEGIN and COMMIT.
#[derive(Debug, Clone, PartialEq)]
pub struct LogicalTransaction {
    pub xid: u32,
    pub begin_lsn: PgLsn,
    pub commit_lsn: PgLsn,
    pub timestamp: String,
    pub statements: Vec<LogicalStatement>,
}

impl LogicalTransaction {
    pub fn new(xid: u32, begin_lsn: PgLsn, timestamp: String) -> Self {
        LogicalTransaction {
            xid,
            begin_lsn,
            commit_lsn: PgLsn::from(0),
            timestamp,
            statements: Vec::new(),
        }
    }

    pub fn append(&mut self, statement: LogicalStatement) {
        self.statements.push(statement);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_render_as_sql_literals() {
        assert_eq!(LogicalValue::Null.render(), "NULL");
        assert_eq!(LogicalValue::Bool(true).render(), "true");
        assert_eq!(LogicalValue::Bool(false).render(), "false");
        assert_eq!(LogicalValue::Integer(-42).render(), "-42");
        assert_eq!(LogicalValue::Float(1.5).render(), "1.5");
        assert_eq!(LogicalValue::Text("it's".into()).render(), "'it''s'");
        assert_eq!(LogicalValue::Verbatim("3.14159".into()).render(), "3.14159");
    }

    #[test]
    fn text_with_newlines_stays_on_one_line() {
        let rendered = LogicalValue::Text("line one\nline two".into()).render();
        assert_eq!(rendered, "E'line one\\nline two'");
        assert!(!rendered.contains('\n'));
    }

    #[test]
    fn float_rendering_round_trips() {
        let value = 0.123456789012345678_f64;
        let rendered = LogicalValue::Float(value).render();
        assert_eq!(rendered.parse::<f64>().unwrap(), value);
    }

    #[test]
    fn actions_parse_from_their_tag() {
        assert_eq!(StreamAction::from_char('B').unwrap(), StreamAction::Begin);
        assert_eq!(StreamAction::from_char('K').unwrap(), StreamAction::Keepalive);
        assert!(StreamAction::from_char('Z').is_err());
    }
}
