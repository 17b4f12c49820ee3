//! The receive process: logical decoding stream to JSON-lines files.
//!
//! Opens the replication slot's stream and appends one JSON document per
//! decoded message to the segment file owning the message's LSN. Files
//! rotate on WAL segment boundaries; each closed file is posted to the
//! transform queue. Feedback (the confirmed flush position) goes back to the
//! source on its keepalive cadence, and the sentinel mirrors the written and
//! flushed positions.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::StreamExt;
use postgres_replication::ReplicationStream;
use postgres_replication::protocol::ReplicationMessage;
use serde_json::{Map, Value, json};
use tokio_postgres::types::PgLsn;
use tracing::{debug, info};

use crate::bail;
use crate::cdc::messages::{MessageMetadata, StreamAction};
use crate::cdc::{
    OutputPlugin, StreamDbContext, StreamSpecs, json_file_path, segment_start, sentinel,
    test_decoding, wal2json,
};
use crate::concurrency::queue::QueueSender;
use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{ErrorKind, Result};
use crate::pgclone_error;
use crate::pgsql::{ConnKind, PgConnection, connect_replication};

/// Microseconds between the Unix and Postgres epochs (2000-01-01).
const POSTGRES_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

fn postgres_epoch_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as i64)
        .unwrap_or(0)
        - POSTGRES_EPOCH_OFFSET_MICROS
}

/// The JSON file currently being written.
struct SegmentFile {
    segment: PgLsn,
    path: PathBuf,
    file: File,
}

/// Streams the logical decoding messages into segment files until the end
/// position is reached or a shutdown is requested.
pub async fn stream_receive(
    specs: StreamSpecs,
    transform_queue: QueueSender<PathBuf>,
    mut shutdown: ShutdownRx,
) -> Result<()> {
    let source = PgConnection::connect(&specs.source_pguri, ConnKind::Source).await?;
    let sentinel_record = sentinel::fetch_sentinel(&source).await?;
    let mut endpos = sentinel_record.endpos.or(specs.endpos);

    let replication = connect_replication(&specs.source_pguri).await?;
    let context = identify_system(&replication).await?;
    context.verify_against(&specs.paths)?;

    // Restart where the last run left off, never before the slot start.
    let startpos = sentinel_record
        .flush_lsn
        .max(sentinel_record.startpos);

    info!(
        slot = %specs.slot_name,
        plugin = specs.plugin.name(),
        startpos = %startpos,
        timeline = context.timeline,
        "starting logical decoding stream"
    );

    let query = format!(
        "START_REPLICATION SLOT \"{}\" LOGICAL {} {}",
        specs.slot_name,
        startpos,
        specs.plugin.start_options()
    );
    let duplex = replication
        .copy_both_simple::<bytes::Bytes>(&query)
        .await
        .map_err(|err| {
            pgclone_error!(
                ErrorKind::ReplicationSlotFailed,
                "START_REPLICATION failed",
                format!("{query}: {err}")
            )
        })?;
    let mut stream = Box::pin(ReplicationStream::new(duplex));

    let mut current: Option<SegmentFile> = None;
    let mut current_xid: u32 = 0;
    let mut write_lsn = startpos;
    let mut flush_lsn = startpos;

    loop {
        let message = tokio::select! {
            _ = shutdown.requested() => break,
            message = stream.next() => message,
        };

        let Some(message) = message else {
            debug!("replication stream ended");
            break;
        };
        let message = message.map_err(|err| {
            pgclone_error!(
                ErrorKind::ReplicationSlotFailed,
                "reading the replication stream failed",
                err
            )
        })?;

        match message {
            ReplicationMessage::XLogData(body) => {
                let wal_start = PgLsn::from(body.wal_start());
                let payload = String::from_utf8_lossy(body.data()).into_owned();

                let (metadata, line) =
                    prepare_json_line(specs.plugin, &payload, wal_start, &mut current_xid)?;

                rotate_if_needed(
                    &specs,
                    &context,
                    &transform_queue,
                    &mut current,
                    metadata.lsn,
                )
                .await?;

                if let Some(segment) = current.as_mut() {
                    segment.file.write_all(line.as_bytes())?;
                    segment.file.write_all(b"\n")?;
                }
                write_lsn = metadata.lsn.max(write_lsn);

                if let Some(endpos) = endpos
                    && metadata.lsn >= endpos
                {
                    info!(endpos = %endpos, lsn = %metadata.lsn, "end position reached");
                    break;
                }
            }
            ReplicationMessage::PrimaryKeepAlive(keepalive) => {
                let wal_end = PgLsn::from(keepalive.wal_end());

                // Persist a keepalive marker so apply can publish liveness
                // even when no transaction is flowing.
                let line = json!({
                    "action": "K",
                    "xid": 0,
                    "lsn": wal_end.to_string(),
                    "timestamp": chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.6f+00").to_string(),
                })
                .to_string();

                rotate_if_needed(&specs, &context, &transform_queue, &mut current, wal_end)
                    .await?;
                if let Some(segment) = current.as_mut() {
                    segment.file.write_all(line.as_bytes())?;
                    segment.file.write_all(b"\n")?;
                    segment.file.flush()?;
                }
                write_lsn = wal_end.max(write_lsn);
                flush_lsn = write_lsn;

                if keepalive.reply() == 1 {
                    stream
                        .as_mut()
                        .standby_status_update(
                            write_lsn,
                            flush_lsn,
                            flush_lsn,
                            postgres_epoch_now(),
                            0,
                        )
                        .await
                        .map_err(|err| {
                            pgclone_error!(
                                ErrorKind::ReplicationSlotFailed,
                                "sending standby status update failed",
                                err
                            )
                        })?;
                    debug!(write = %write_lsn, flush = %flush_lsn, "sent standby status update");
                }

                sentinel::update_written(&source, write_lsn, flush_lsn).await?;

                // The sentinel may have grown an end position since we
                // started; keepalives are the natural point to notice.
                let record = sentinel::fetch_sentinel(&source).await?;
                endpos = record.endpos.or(endpos);
                if let Some(endpos) = endpos
                    && wal_end >= endpos
                {
                    info!(endpos = %endpos, "end position reached on keepalive");
                    break;
                }
            }
            _ => {}
        }
    }

    // Flush and hand the last (partial) file to transform.
    if let Some(segment) = current.take() {
        close_segment(segment, &transform_queue).await?;
    }
    sentinel::update_written(&source, write_lsn, flush_lsn).await?;

    info!(write = %write_lsn, "logical decoding stream stopped");
    Ok(())
}

/// Runs IDENTIFY_SYSTEM and SHOW wal_segment_size on the replication
/// connection.
async fn identify_system(replication: &tokio_postgres::Client) -> Result<StreamDbContext> {
    let messages = replication.simple_query("IDENTIFY_SYSTEM").await?;
    let row = simple_row(&messages).ok_or_else(|| {
        pgclone_error!(ErrorKind::SourceDatabase, "IDENTIFY_SYSTEM returned no row")
    })?;

    let timeline: u32 = row
        .get("timeline")
        .and_then(|value| value.parse().ok())
        .ok_or_else(|| {
            pgclone_error!(ErrorKind::SourceDatabase, "invalid IDENTIFY_SYSTEM timeline")
        })?;

    let messages = replication.simple_query("SHOW wal_segment_size").await?;
    let row = simple_row(&messages).ok_or_else(|| {
        pgclone_error!(ErrorKind::SourceDatabase, "SHOW wal_segment_size returned no row")
    })?;
    let pretty = row.get("wal_segment_size").unwrap_or("16MB");
    let wal_segment_size = pretty
        .parse::<pgclone_config::ByteSize>()
        .map_err(|err| {
            pgclone_error!(
                ErrorKind::SourceDatabase,
                "invalid wal_segment_size",
                format!("{pretty:?}: {err}")
            )
        })?
        .bytes;

    Ok(StreamDbContext {
        timeline,
        wal_segment_size,
    })
}

fn simple_row(
    messages: &[tokio_postgres::SimpleQueryMessage],
) -> Option<&tokio_postgres::SimpleQueryRow> {
    messages.iter().find_map(|message| match message {
        tokio_postgres::SimpleQueryMessage::Row(row) => Some(row),
        _ => None,
    })
}

/// Closes the current segment file when the given position belongs to a
/// later segment, posts it to the transform queue, and opens the new file.
async fn rotate_if_needed(
    specs: &StreamSpecs,
    context: &StreamDbContext,
    transform_queue: &QueueSender<PathBuf>,
    current: &mut Option<SegmentFile>,
    lsn: PgLsn,
) -> Result<()> {
    let segment = segment_start(lsn, context.wal_segment_size);

    if let Some(open) = current.as_ref()
        && open.segment == segment
    {
        return Ok(());
    }

    if let Some(previous) = current.take() {
        close_segment(previous, transform_queue).await?;
    }

    let path = json_file_path(&specs.paths, context, lsn);
    debug!(file = %path.display(), "opening segment file");

    // Append: a resumed stream re-enters the segment it stopped in.
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    *current = Some(SegmentFile {
        segment,
        path,
        file,
    });

    Ok(())
}

async fn close_segment(
    mut segment: SegmentFile,
    transform_queue: &QueueSender<PathBuf>,
) -> Result<()> {
    segment.file.flush()?;
    segment.file.sync_all()?;
    info!(file = %segment.path.display(), "closed segment file");
    transform_queue.send(segment.path).await
}

/// Builds the JSON line for one decoded message and its metadata.
///
/// wal2json documents pass through with the lsn injected when the plugin
/// left it out; test_decoding lines are wrapped in an envelope carrying the
/// metadata next to the raw message. test_decoding only puts the xid on
/// BEGIN, so the current transaction's xid is tracked across calls.
pub fn prepare_json_line(
    plugin: OutputPlugin,
    payload: &str,
    wal_start: PgLsn,
    current_xid: &mut u32,
) -> Result<(MessageMetadata, String)> {
    match plugin {
        OutputPlugin::Wal2Json => {
            let value: Value = serde_json::from_str(payload)?;
            let mut metadata = wal2json::parse_metadata(&value)?;
            if u64::from(metadata.lsn) == 0 {
                metadata.lsn = wal_start;
            }

            let Value::Object(mut object) = value else {
                bail!(
                    ErrorKind::InvalidCdcMessage,
                    "wal2json message is not an object",
                    payload
                );
            };
            object.insert("lsn".to_string(), Value::String(metadata.lsn.to_string()));
            object
                .entry("xid")
                .or_insert_with(|| Value::Number(metadata.xid.into()));

            Ok((metadata, Value::Object(object).to_string()))
        }
        OutputPlugin::TestDecoding => {
            let (action, xid) = test_decoding::parse_action_and_xid(payload)?;
            let xid = match action {
                StreamAction::Begin => {
                    *current_xid = xid;
                    xid
                }
                StreamAction::Commit => {
                    let xid = if xid != 0 { xid } else { *current_xid };
                    *current_xid = 0;
                    xid
                }
                _ => *current_xid,
            };

            let timestamp = match action {
                StreamAction::Commit => {
                    test_decoding::parse_commit_timestamp(payload).unwrap_or_default()
                }
                _ => String::new(),
            };

            let metadata = MessageMetadata {
                action,
                xid,
                lsn: wal_start,
                timestamp: timestamp.clone(),
            };

            let mut object = Map::new();
            object.insert("action".into(), serde_json::to_value(action)?);
            object.insert("xid".into(), Value::Number(xid.into()));
            object.insert("lsn".into(), Value::String(wal_start.to_string()));
            object.insert("timestamp".into(), Value::String(timestamp));
            object.insert("message".into(), Value::String(payload.to_string()));

            Ok((metadata, Value::Object(object).to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pgsql::parse_lsn;

    #[test]
    fn wal2json_lines_pass_through_with_lsn_injected() {
        let mut xid = 0;
        let (metadata, line) = prepare_json_line(
            OutputPlugin::Wal2Json,
            r#"{"action":"B","xid":529}"#,
            parse_lsn("0/1949710").unwrap(),
            &mut xid,
        )
        .unwrap();

        assert_eq!(metadata.action, StreamAction::Begin);
        assert_eq!(u64::from(metadata.lsn), 0x1949710);

        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["lsn"], "0/1949710");
        assert_eq!(value["xid"], 529);
    }

    #[test]
    fn test_decoding_envelope_tracks_the_transaction_xid() {
        let mut xid = 0;
        let lsn = parse_lsn("0/100").unwrap();

        let (begin, _) =
            prepare_json_line(OutputPlugin::TestDecoding, "BEGIN 529", lsn, &mut xid).unwrap();
        assert_eq!(begin.xid, 529);

        let (insert, line) = prepare_json_line(
            OutputPlugin::TestDecoding,
            "table public.users: INSERT: id[integer]:1",
            parse_lsn("0/110").unwrap(),
            &mut xid,
        )
        .unwrap();
        assert_eq!(insert.action, StreamAction::Insert);
        assert_eq!(insert.xid, 529);

        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["action"], "I");
        assert_eq!(value["message"], "table public.users: INSERT: id[integer]:1");

        let (commit, _) = prepare_json_line(
            OutputPlugin::TestDecoding,
            "COMMIT 529 (at 2024-01-15 10:00:00.123456+00)",
            parse_lsn("0/200").unwrap(),
            &mut xid,
        )
        .unwrap();
        assert_eq!(commit.xid, 529);
        assert_eq!(commit.timestamp, "2024-01-15 10:00:00.123456+00");
        assert_eq!(xid, 0);
    }

    #[test]
    fn envelope_lines_parse_back_through_transform() {
        let mut xid = 0;
        let (_, line) = prepare_json_line(
            OutputPlugin::TestDecoding,
            "BEGIN 7",
            parse_lsn("0/500").unwrap(),
            &mut xid,
        )
        .unwrap();

        let value: Value = serde_json::from_str(&line).unwrap();
        let metadata = crate::cdc::transform::metadata_from_line(&value).unwrap();
        assert_eq!(metadata.action, StreamAction::Begin);
        assert_eq!(metadata.xid, 7);
    }
}
