use std::{error, fmt, result};

/// Type alias for convenience when using the Result type with our Error.
pub type Result<T> = result::Result<T, Error>;

/// Internal error representation with kind, static description, optional
/// dynamic detail and optional source error.
///
/// Uses boxing to keep the public Error type size consistent and enable
/// rich error context without penalizing the success path.
struct ErrorInner {
    kind: ErrorKind,
    description: &'static str,
    detail: Option<String>,
    source: Option<Box<dyn error::Error + Send + Sync>>,
}

/// Error classification for pgclone operations.
///
/// The kinds map to the failure families a whole-database copy can hit:
/// configuration problems caught before any I/O, environmental problems in
/// the work directory, database errors on either side, corrupt on-disk
/// progress files, and invariant violations which are always bugs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Bad URI, missing environment variable, unparseable option value.
    Configuration,
    /// Work directory exists and belongs to a live process.
    WorkDirBusy,
    /// Work directory is in a state that needs --restart or --resume.
    WorkDirState,
    /// Filesystem operation failure.
    Io,
    /// Error reported by the source database.
    SourceDatabase,
    /// Error reported by the target database.
    TargetDatabase,
    /// Snapshot export, adoption or re-use failure.
    SnapshotFailed,
    /// SQL query execution failure.
    QueryFailed,
    /// COPY data transfer failure.
    CopyFailed,
    /// pg_dump / pg_dumpall subprocess failure.
    DumpFailed,
    /// pg_restore subprocess failure.
    RestoreFailed,
    /// Summary or progress file exists but cannot be parsed.
    SummaryCorrupted,
    /// Malformed logical decoding message.
    InvalidCdcMessage,
    /// Malformed LSN representation.
    InvalidLsn,
    /// The sentinel record is missing on the source.
    SentinelMissing,
    /// Replication slot create/drop/stream failure.
    ReplicationSlotFailed,
    /// Replication origin create/setup/progress failure.
    OriginFailed,
    /// A worker task panicked.
    WorkerPanic,
    /// A worker task returned a failure.
    WorkerFailed,
    /// The operation was interrupted by a shutdown request.
    ShuttingDown,
    /// A "cannot happen" condition; always logged with a BUG: prefix.
    InvariantViolation,
    /// Aggregation of several worker errors.
    Many,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::WorkDirBusy => "work directory busy",
            ErrorKind::WorkDirState => "work directory state",
            ErrorKind::Io => "io",
            ErrorKind::SourceDatabase => "source database",
            ErrorKind::TargetDatabase => "target database",
            ErrorKind::SnapshotFailed => "snapshot",
            ErrorKind::QueryFailed => "query",
            ErrorKind::CopyFailed => "copy",
            ErrorKind::DumpFailed => "dump",
            ErrorKind::RestoreFailed => "restore",
            ErrorKind::SummaryCorrupted => "summary corrupted",
            ErrorKind::InvalidCdcMessage => "invalid cdc message",
            ErrorKind::InvalidLsn => "invalid lsn",
            ErrorKind::SentinelMissing => "sentinel missing",
            ErrorKind::ReplicationSlotFailed => "replication slot",
            ErrorKind::OriginFailed => "replication origin",
            ErrorKind::WorkerPanic => "worker panic",
            ErrorKind::WorkerFailed => "worker failed",
            ErrorKind::ShuttingDown => "shutting down",
            ErrorKind::InvariantViolation => "BUG",
            ErrorKind::Many => "multiple errors",
        };
        f.write_str(name)
    }
}

/// The error type for pgclone operations.
///
/// Carries a [`ErrorKind`] for classification, a static description, and
/// optionally a dynamic detail string and a source error. Constructed through
/// the [`crate::pgclone_error!`] and [`crate::bail!`] macros in most places.
pub struct Error(Box<ErrorInner>);

impl Error {
    pub fn new(kind: ErrorKind, description: &'static str) -> Self {
        Error(Box::new(ErrorInner {
            kind,
            description,
            detail: None,
            source: None,
        }))
    }

    pub fn with_detail(kind: ErrorKind, description: &'static str, detail: String) -> Self {
        Error(Box::new(ErrorInner {
            kind,
            description,
            detail: Some(detail),
            source: None,
        }))
    }

    pub fn with_source<E>(kind: ErrorKind, description: &'static str, source: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        Error(Box::new(ErrorInner {
            kind,
            description,
            detail: None,
            source: Some(source.into()),
        }))
    }

    /// Aggregates worker errors into a single error, used when draining pools.
    pub fn from_many(errors: Vec<Error>) -> Self {
        debug_assert!(!errors.is_empty());
        let detail = errors
            .iter()
            .map(|err| err.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        Error(Box::new(ErrorInner {
            kind: ErrorKind::Many,
            description: "several workers failed",
            detail: Some(format!("{} errors: {detail}", errors.len())),
            source: None,
        }))
    }

    pub fn kind(&self) -> ErrorKind {
        self.0.kind
    }

    /// True when the error only signals a cooperative shutdown, which the
    /// orchestrator treats as a clean stop rather than a failure.
    pub fn is_shutdown(&self) -> bool {
        self.0.kind == ErrorKind::ShuttingDown
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("kind", &self.0.kind)
            .field("description", &self.0.description)
            .field("detail", &self.0.detail)
            .field("source", &self.0.source)
            .finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.kind == ErrorKind::InvariantViolation {
            write!(f, "BUG: {}", self.0.description)?;
        } else {
            f.write_str(self.0.description)?;
        }
        if let Some(detail) = &self.0.detail {
            write!(f, ": {detail}")?;
        }
        if let Some(source) = &self.0.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.0
            .source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn error::Error + 'static))
    }
}

impl From<(ErrorKind, &'static str)> for Error {
    fn from((kind, description): (ErrorKind, &'static str)) -> Self {
        Error::new(kind, description)
    }
}

impl From<(ErrorKind, &'static str, String)> for Error {
    fn from((kind, description, detail): (ErrorKind, &'static str, String)) -> Self {
        Error::with_detail(kind, description, detail)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::with_source(ErrorKind::Io, "filesystem operation failed", err)
    }
}

impl From<tokio_postgres::Error> for Error {
    fn from(err: tokio_postgres::Error) -> Self {
        Error::with_source(ErrorKind::QueryFailed, "postgres operation failed", err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::with_source(ErrorKind::InvalidCdcMessage, "json processing failed", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_detail() {
        let err = Error::with_detail(
            ErrorKind::Configuration,
            "invalid table jobs",
            "expected a positive integer".to_string(),
        );
        assert_eq!(
            err.to_string(),
            "invalid table jobs: expected a positive integer"
        );
    }

    #[test]
    fn invariant_violations_carry_bug_prefix() {
        let err = Error::new(ErrorKind::InvariantViolation, "part number out of range");
        assert!(err.to_string().starts_with("BUG: "));
    }

    #[test]
    fn from_many_counts_errors() {
        let err = Error::from_many(vec![
            Error::new(ErrorKind::CopyFailed, "copy failed"),
            Error::new(ErrorKind::QueryFailed, "query failed"),
        ]);
        assert_eq!(err.kind(), ErrorKind::Many);
        assert!(err.to_string().contains("2 errors"));
    }
}
