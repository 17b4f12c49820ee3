//! Typed wrapper over tokio-postgres for the source and target connections.
//!
//! Every worker owns its own [`PgConnection`]; connections are never shared.
//! Connecting applies the per-side session settings (bulk-load friendly GUCs
//! on the target, keepalives on the source) before the connection is handed
//! to the caller.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use pgclone_config::{
    PgConnectionOptions, SOURCE_CONNECTION_OPTIONS, TARGET_CONNECTION_OPTIONS, scrub_pguri,
};
use tokio_postgres::config::ReplicationMode;
use tokio_postgres::types::PgLsn;
use tokio_postgres::{Client, Config, CopyInSink, CopyOutStream, NoTls, Row, SimpleQueryMessage};
use tracing::{debug, error, info};

use crate::error::{ErrorKind, Result};
use crate::pgclone_error;

/// Which side of the copy a connection talks to; decides the session GUCs
/// and the error kind reported on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    Source,
    Target,
}

impl ConnKind {
    pub fn error_kind(self) -> ErrorKind {
        match self {
            ConnKind::Source => ErrorKind::SourceDatabase,
            ConnKind::Target => ErrorKind::TargetDatabase,
        }
    }

    fn options(self) -> &'static PgConnectionOptions {
        match self {
            ConnKind::Source => &SOURCE_CONNECTION_OPTIONS,
            ConnKind::Target => &TARGET_CONNECTION_OPTIONS,
        }
    }
}

/// Spawns a background task driving a Postgres connection until it terminates.
fn spawn_connection_task<S>(connection: tokio_postgres::Connection<tokio_postgres::Socket, S>)
where
    S: tokio_postgres::tls::TlsStream + Unpin + Send + 'static,
{
    // The client terminates the connection when dropped, so the handle does
    // not need to be tracked.
    tokio::spawn(async move {
        match connection.await {
            Err(err) => error!(error = %err, "postgres connection error"),
            Ok(()) => debug!("postgres connection terminated"),
        }
    });
}

/// A session with one of the two databases.
pub struct PgConnection {
    client: Client,
    kind: ConnKind,
}

impl PgConnection {
    /// Connects and applies the side-specific session settings.
    pub async fn connect(pguri: &str, kind: ConnKind) -> Result<Self> {
        let config: Config = pguri.parse().map_err(|err| {
            pgclone_error!(
                ErrorKind::Configuration,
                "invalid connection string",
                format!("{}: {err}", scrub_pguri(pguri))
            )
        })?;

        let (client, connection) = config.connect(NoTls).await.map_err(|err| {
            pgclone_error!(
                kind.error_kind(),
                "failed to connect",
                format!("{}: {err}", scrub_pguri(pguri))
            )
        })?;
        spawn_connection_task(connection);

        info!(pguri = %scrub_pguri(pguri), side = ?kind, "connected to postgres");

        let conn = PgConnection { client, kind };
        for statement in kind.options().to_set_statements() {
            conn.execute(&statement).await?;
        }

        Ok(conn)
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Runs a statement that returns no rows.
    pub async fn execute(&self, sql: &str) -> Result<u64> {
        self.client.execute(sql, &[]).await.map_err(|err| {
            pgclone_error!(ErrorKind::QueryFailed, "query failed", format!("{sql}: {err}"))
        })
    }

    /// Runs a parameterized query and returns its rows.
    pub async fn query(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<Vec<Row>> {
        self.client.query(sql, params).await.map_err(|err| {
            pgclone_error!(ErrorKind::QueryFailed, "query failed", format!("{sql}: {err}"))
        })
    }

    /// Runs a parameterized query expected to return exactly one row.
    pub async fn query_one(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<Row> {
        self.client.query_one(sql, params).await.map_err(|err| {
            pgclone_error!(ErrorKind::QueryFailed, "query failed", format!("{sql}: {err}"))
        })
    }

    /// Runs statements through the simple-query protocol, needed for commands
    /// that cannot be prepared (SET TRANSACTION SNAPSHOT, VACUUM, ...).
    pub async fn simple_query(&self, sql: &str) -> Result<Vec<SimpleQueryMessage>> {
        self.client.simple_query(sql).await.map_err(|err| {
            pgclone_error!(ErrorKind::QueryFailed, "query failed", format!("{sql}: {err}"))
        })
    }

    pub async fn begin(&self) -> Result<()> {
        self.execute("BEGIN").await?;
        Ok(())
    }

    pub async fn commit(&self) -> Result<()> {
        self.execute("COMMIT").await?;
        Ok(())
    }

    pub async fn rollback(&self) -> Result<()> {
        self.execute("ROLLBACK").await?;
        Ok(())
    }

    /// Sets the isolation characteristics of the current transaction.
    pub async fn set_transaction(
        &self,
        isolation: IsolationLevel,
        read_only: bool,
        deferrable: bool,
    ) -> Result<()> {
        let sql = format!(
            "SET TRANSACTION ISOLATION LEVEL {} {} {}",
            isolation.as_sql(),
            if read_only { "READ ONLY" } else { "READ WRITE" },
            if deferrable { "DEFERRABLE" } else { "NOT DEFERRABLE" },
        );
        self.simple_query(&sql).await?;
        Ok(())
    }

    /// Exports the snapshot of the current transaction.
    pub async fn export_snapshot(&self) -> Result<String> {
        let row = self.query_one("SELECT pg_export_snapshot()", &[]).await?;
        Ok(row.get(0))
    }

    /// Adopts an already exported snapshot in the current transaction.
    pub async fn set_snapshot(&self, snapshot: &str) -> Result<()> {
        let sql = format!(
            "SET TRANSACTION SNAPSHOT {}",
            pg_escape::quote_literal(snapshot)
        );
        self.simple_query(&sql).await?;
        Ok(())
    }

    /// Starts a COPY .. TO STDOUT and returns the raw byte stream.
    pub async fn copy_out(&self, sql: &str) -> Result<CopyOutStream> {
        self.client.copy_out(sql).await.map_err(|err| {
            pgclone_error!(ErrorKind::CopyFailed, "copy out failed", format!("{sql}: {err}"))
        })
    }

    /// Starts a COPY .. FROM STDIN and returns the sink to feed.
    pub async fn copy_in(&self, sql: &str) -> Result<CopyInSink<Bytes>> {
        self.client.copy_in(sql).await.map_err(|err| {
            pgclone_error!(ErrorKind::CopyFailed, "copy in failed", format!("{sql}: {err}"))
        })
    }

    pub fn kind(&self) -> ConnKind {
        self.kind
    }
}

/// Transaction isolation levels pgclone uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    Serializable,
    RepeatableRead,
}

impl IsolationLevel {
    fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::Serializable => "SERIALIZABLE",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
        }
    }
}

/// Streams one COPY from the source to the target, returning the row count
/// reported by the target.
pub async fn copy_stream(
    source: &PgConnection,
    target: &PgConnection,
    copy_out_sql: &str,
    copy_in_sql: &str,
) -> Result<u64> {
    let out = source.copy_out(copy_out_sql).await?;
    let sink = target.copy_in(copy_in_sql).await?;
    futures::pin_mut!(out, sink);

    while let Some(chunk) = out.next().await {
        let chunk = chunk.map_err(|err| {
            pgclone_error!(
                ErrorKind::CopyFailed,
                "reading copy data from source failed",
                err
            )
        })?;
        sink.send(chunk).await.map_err(|err| {
            pgclone_error!(
                ErrorKind::CopyFailed,
                "writing copy data to target failed",
                err
            )
        })?;
    }

    let rows = sink.finish().await.map_err(|err| {
        pgclone_error!(ErrorKind::CopyFailed, "finishing copy on target failed", err)
    })?;

    Ok(rows)
}

/// Connects with the logical replication protocol enabled.
///
/// The returned client accepts the replication-only simple-query commands
/// (IDENTIFY_SYSTEM, START_REPLICATION, CREATE_REPLICATION_SLOT).
pub async fn connect_replication(pguri: &str) -> Result<Client> {
    let mut config: Config = pguri.parse().map_err(|err| {
        pgclone_error!(
            ErrorKind::Configuration,
            "invalid connection string",
            format!("{}: {err}", scrub_pguri(pguri))
        )
    })?;
    config.replication_mode(ReplicationMode::Logical);

    let (client, connection) = config.connect(NoTls).await.map_err(|err| {
        pgclone_error!(
            ErrorKind::ReplicationSlotFailed,
            "failed to open replication connection",
            format!("{}: {err}", scrub_pguri(pguri))
        )
    })?;
    spawn_connection_task(connection);

    info!(pguri = %scrub_pguri(pguri), "opened logical replication connection");

    Ok(client)
}

/// Parses an `X/Y` log sequence number.
pub fn parse_lsn(input: &str) -> Result<PgLsn> {
    input
        .trim()
        .parse::<PgLsn>()
        .map_err(|_| pgclone_error!(ErrorKind::InvalidLsn, "invalid lsn", format!("{input:?}")))
}

/// Renders the `"nspname"."relname"` form used in generated SQL.
pub fn qualified_name(nspname: &str, relname: &str) -> String {
    format!(
        "{}.{}",
        pg_escape::quote_identifier(nspname),
        pg_escape::quote_identifier(relname)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_lsn_accepts_wal_notation() {
        let lsn = parse_lsn("0/1949710").unwrap();
        assert_eq!(u64::from(lsn), 0x1949710);

        let lsn = parse_lsn("16/B374D848").unwrap();
        assert_eq!(u64::from(lsn), (0x16 << 32) | 0xB374D848);
    }

    #[test]
    fn parse_lsn_rejects_garbage() {
        assert_eq!(parse_lsn("pants").unwrap_err().kind(), ErrorKind::InvalidLsn);
        assert_eq!(parse_lsn("").unwrap_err().kind(), ErrorKind::InvalidLsn);
    }

    #[test]
    fn qualified_name_quotes_identifiers() {
        assert_eq!(qualified_name("public", "orders"), "public.orders");
        assert_eq!(
            qualified_name("Sales", "order items"),
            "\"Sales\".\"order items\""
        );
    }
}
