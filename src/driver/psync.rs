// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! PSYNC driver: a protocol-level replica of the source.
//!
//! State machine:
//!
//! ```text
//! Init ─▶ Handshake ─▶ FullResync ─▶ Streaming
//!             ▲   │        (RDB)        │
//!             │   └──── CONTINUE ───────┤
//!             │                         │ transport error
//!             └──────── Backoff ◀───────┘
//! ```
//!
//! - Handshake: PING, `REPLCONF listening-port`, `REPLCONF capa eof`,
//!   `REPLCONF capa psync2`, then `PSYNC ? -1` (first time) or
//!   `PSYNC <replid> <offset>` (partial resync).
//! - FULLRESYNC records the replication id + offset and consumes the RDB
//!   payload through the structural parser; a payload the parser cannot
//!   fully decode is drained and healed by a scan-walk backfill before
//!   streaming begins, so no key silently goes missing. CONTINUE jumps
//!   straight to Streaming.
//! - Streaming parses inline RESP commands and translates them into
//!   change events; `REPLCONF ACK <offset>` goes out every second as the
//!   source's liveness signal.
//!
//! Offset discipline: the bytes-consumed counter advances only after a
//! command has fully parsed, never mid-command, so the offset sent on
//! reconnect covers exactly what was applied. It is monotone
//! non-decreasing for the lifetime of one Streaming session and survives
//! disconnects for partial resync; only a FULLRESYNC replaces it.
//!
//! Three consecutive handshakes answered with something we do not
//! recognize (managed offerings commonly refuse PSYNC) end with
//! [`SyncError::Downgrade`], and the coordinator swaps in the scan
//! driver.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{shutdown_requested, ChangeDriver, DriverFuture};
use crate::codec::{ReadOutcome, ValueCodec};
use crate::config::{DriverKind, EndpointConfig, IncrementalConfig};
use crate::dispatch::MemoryGauge;
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::rdb::{RdbEntry, RdbEvent, RdbParser};
use crate::record::{epoch_millis, ChangeEvent, KeyKind, KeyRecord, KeyValue};
use crate::replication::{FillOutcome, RdbConduit, ReplLink};
use crate::resilience::RateLimiter;
use crate::resp::{RespParser, StreamCommand};
use crate::session::ManagedSession;
use crate::status::StatusBoard;

/// Consecutive unrecognized handshake replies before downgrading.
const MAX_HANDSHAKE_FAILURES: u32 = 3;

/// Reconnect backoff bounds while the cursor is retained.
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Replication position: id + byte offset into the command stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationCursor {
    pub replid: String,
    pub offset: u64,
}

pub struct PsyncDriver {
    endpoint: EndpointConfig,
    source: Arc<ManagedSession>,
    config: IncrementalConfig,
    codec: ValueCodec,
    gauge: Arc<MemoryGauge>,
    limiter: Option<Arc<RateLimiter>>,
    status: Arc<StatusBoard>,
    cursor: Option<ReplicationCursor>,
    handshake_failures: u32,
}

impl PsyncDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        endpoint: EndpointConfig,
        source: Arc<ManagedSession>,
        config: IncrementalConfig,
        preserve_ttl: bool,
        gauge: Arc<MemoryGauge>,
        limiter: Option<Arc<RateLimiter>>,
        status: Arc<StatusBoard>,
    ) -> Self {
        Self {
            endpoint,
            source,
            config,
            codec: ValueCodec::new(preserve_ttl),
            gauge,
            limiter,
            status,
            cursor: None,
            handshake_failures: 0,
        }
    }

    /// One connection lifetime: handshake, optional full resync, then
    /// streaming until the link drops or shutdown.
    async fn connect_and_stream(
        &mut self,
        out: &mpsc::Sender<ChangeEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let deadline = self.endpoint.socket_timeout();
        self.status.set_driver_state("handshake");
        metrics::record_driver_state("psync", "handshake");

        let mut link = ReplLink::connect(&self.endpoint).await?;

        // Handshake. Unexpected replies are protocol failures that count
        // toward the downgrade threshold.
        link.send(&[b"PING"]).await?;
        expect_reply(&link.read_line(deadline).await?, "+PONG")?;

        let port = self.config.listening_port.to_string();
        link.send(&[b"REPLCONF", b"listening-port", port.as_bytes()]).await?;
        expect_reply(&link.read_line(deadline).await?, "+OK")?;

        link.send(&[b"REPLCONF", b"capa", b"eof"]).await?;
        expect_reply(&link.read_line(deadline).await?, "+OK")?;

        link.send(&[b"REPLCONF", b"capa", b"psync2"]).await?;
        expect_reply(&link.read_line(deadline).await?, "+OK")?;

        // PSYNC with the retained cursor, or a fresh full resync.
        match &self.cursor {
            Some(cursor) => {
                let offset = cursor.offset.to_string();
                info!(replid = %cursor.replid, offset = cursor.offset, "Attempting partial resync");
                link.send(&[b"PSYNC", cursor.replid.as_bytes(), offset.as_bytes()]).await?;
            }
            None => {
                info!("Requesting full resync");
                link.send(&[b"PSYNC", b"?", b"-1"]).await?;
            }
        }

        let reply = link.read_line(deadline).await?;
        let reply = reply.trim_start_matches('\n');
        if let Some(rest) = reply.strip_prefix("+FULLRESYNC ") {
            let mut parts = rest.split_whitespace();
            let replid = parts
                .next()
                .ok_or_else(|| SyncError::Protocol(format!("bad FULLRESYNC '{}'", reply)))?
                .to_string();
            let offset: u64 = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| SyncError::Protocol(format!("bad FULLRESYNC '{}'", reply)))?;

            info!(replid = %replid, offset, "Full resync granted");
            self.cursor = Some(ReplicationCursor {
                replid: replid.clone(),
                offset,
            });
            self.status.set_replication_cursor(&replid, offset);
            self.handshake_failures = 0;

            self.consume_rdb(&mut link, out, deadline).await?;
        } else if reply.starts_with("+CONTINUE") {
            // Partial resync accepted; psync2 may hand us a new replid.
            if let Some(new_id) = reply.strip_prefix("+CONTINUE ").map(str::trim) {
                if !new_id.is_empty() {
                    if let Some(cursor) = &mut self.cursor {
                        cursor.replid = new_id.to_string();
                    }
                }
            }
            let cursor = self.cursor.as_ref().ok_or_else(|| {
                SyncError::Protocol("CONTINUE without a retained cursor".to_string())
            })?;
            info!(replid = %cursor.replid, offset = cursor.offset, "Partial resync accepted");
            self.status.set_replication_cursor(&cursor.replid, cursor.offset);
            self.handshake_failures = 0;
        } else {
            return Err(SyncError::Protocol(format!("unrecognized PSYNC reply '{}'", reply)));
        }

        self.stream(link, out, shutdown).await
    }

    /// Consume the full-resync RDB payload, dispatching what the parser
    /// materializes and re-reading what it cannot.
    async fn consume_rdb(
        &mut self,
        link: &mut ReplLink,
        out: &mpsc::Sender<ChangeEvent>,
        deadline: Duration,
    ) -> Result<()> {
        self.status.set_driver_state("full-resync");
        metrics::record_driver_state("psync", "full-resync");

        let framing = link.read_rdb_header(deadline).await?;
        let mut conduit = RdbConduit::new(framing);
        let mut parser = RdbParser::new();
        let mut needs_fetch: Vec<String> = Vec::new();
        // On parse trouble the payload must still be drained to reach the
        // command stream, but the keys past the error point never left
        // it; `parse_dead` forces a scan backfill below so none are lost.
        let mut parse_dead = false;
        let mut records = 0usize;

        while let Some(chunk) = link.next_rdb_chunk(&mut conduit, deadline).await? {
            if parse_dead {
                continue;
            }
            parser.feed(&chunk);
            loop {
                match parser.next() {
                    Ok(Some(RdbEvent::Entry(RdbEntry::Record(record)))) => {
                        self.gauge.wait_below_limit().await;
                        let event = if record.is_tombstone() {
                            ChangeEvent::delete(record.key)
                        } else {
                            ChangeEvent::write(record)
                        };
                        if out.send(event).await.is_err() {
                            return Err(SyncError::Shutdown);
                        }
                        records += 1;
                    }
                    Ok(Some(RdbEvent::Entry(RdbEntry::NeedsFetch { key }))) => {
                        needs_fetch.push(key);
                    }
                    Ok(Some(RdbEvent::End)) | Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "RDB payload not fully parseable, will backfill via scan");
                        parse_dead = true;
                        break;
                    }
                }
            }
        }

        metrics::record_events_emitted("psync", records);
        info!(records, refetch = needs_fetch.len(), "Full resync payload consumed");

        for key in needs_fetch {
            self.gauge.wait_below_limit().await;
            if let Some(event) = self.refresh(&key).await? {
                if out.send(event).await.is_err() {
                    return Err(SyncError::Shutdown);
                }
            }
        }

        if parse_dead {
            // The parsed prefix was dispatched; everything after the
            // error point exists only on the source. Walk the keyspace
            // before streaming so those keys land too (the dedup cache
            // absorbs the overlap with the prefix).
            warn!("Resync payload partially parsed, backfilling keyspace");
            self.status.set_driver_state("backfill");
            metrics::record_driver_state("psync", "backfill");
            self.scan_backfill(out).await?;
        }
        Ok(())
    }

    /// Codec re-read of the whole keyspace, used when the resync payload
    /// could not be fully parsed. Mirrors the full-sync engine's scan
    /// fallback; errors propagate so an incomplete backfill surfaces as a
    /// reconnect instead of silent data loss.
    async fn scan_backfill(&self, out: &mpsc::Sender<ChangeEvent>) -> Result<()> {
        let mut conn = self.source.acquire().await?;
        let deadline = self.source.op_timeout();
        let mut cursor: u64 = 0;
        let mut sent = 0usize;
        let mut failed = 0usize;

        loop {
            self.gauge.wait_below_limit().await;

            let mut cmd = redis::cmd("SCAN");
            cmd.arg(cursor).arg("COUNT").arg(1000);

            let scanned: (u64, Vec<Vec<u8>>) = match timeout(deadline, cmd.query_async(&mut conn)).await {
                Ok(Ok(reply)) => reply,
                Ok(Err(e)) => return Err(SyncError::redis("SCAN", e)),
                Err(_) => return Err(SyncError::redis_msg("SCAN", "deadline exceeded")),
            };
            let (next, batch) = scanned;

            for raw in batch {
                let key = String::from_utf8_lossy(&raw).into_owned();
                match self.codec.read_key(&mut conn, &key, deadline).await {
                    Ok(ReadOutcome::Record(record)) => {
                        if out.send(ChangeEvent::write(record)).await.is_err() {
                            return Err(SyncError::Shutdown);
                        }
                        sent += 1;
                    }
                    Ok(ReadOutcome::Missing) | Ok(ReadOutcome::Unsupported(_)) => {}
                    Err(e) if e.is_retryable() => {
                        warn!(key = %key, error = %e, "Backfill read failed");
                        failed += 1;
                    }
                    Err(e) => return Err(e),
                }
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        metrics::record_events_emitted("psync", sent);
        info!(sent, failed, "Scan backfill complete");
        Ok(())
    }

    /// Streaming state: parse inline commands, translate, ACK.
    async fn stream(
        &mut self,
        mut link: ReplLink,
        out: &mpsc::Sender<ChangeEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        self.status.set_driver_state("streaming");
        metrics::record_driver_state("psync", "streaming");

        let ack_interval = self.config.ack_interval_duration();
        let mut parser = RespParser::new();
        parser.feed(&link.take_buffered());

        let mut offset = self.cursor.as_ref().map(|c| c.offset).unwrap_or(0);
        let mut last_ack = Instant::now();
        // The DB the master's stream currently addresses; only commands
        // for our configured DB are mirrored.
        let mut selected_db = 0u32;

        loop {
            // Drain every complete command before touching the socket.
            while let Some(cmd) = parser.next_command()? {
                offset += cmd.stream_bytes;

                self.handle_command(&cmd, &mut selected_db, out).await?;

                // Offset advances only after the command is fully handled.
                if let Some(cursor) = &mut self.cursor {
                    cursor.offset = offset;
                }
                self.status.set_replication_offset(offset);
                metrics::record_replication_offset(offset);

                if cmd.name() == "REPLCONF" && cmd.arg_str(1).as_deref() == Some("GETACK") {
                    send_ack(&mut link, offset).await?;
                    last_ack = Instant::now();
                }
            }

            if last_ack.elapsed() >= ack_interval {
                send_ack(&mut link, offset).await?;
                last_ack = Instant::now();
            }

            let wait = ack_interval
                .checked_sub(last_ack.elapsed())
                .unwrap_or(Duration::from_millis(1));

            let mut stopping = false;
            let mut fill_outcome = None;
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    stopping = *shutdown.borrow();
                }

                outcome = link.fill(wait) => {
                    fill_outcome = Some(outcome?);
                }
            }

            if stopping || shutdown_requested(shutdown) {
                // Best-effort goodbye so the master sees a fresh offset.
                let _ = send_ack(&mut link, offset).await;
                return Ok(());
            }

            match fill_outcome {
                Some(FillOutcome::Data(_)) => {
                    self.gauge.wait_below_limit().await;
                    parser.feed(&link.take_buffered());
                }
                Some(FillOutcome::TimedOut) | None => {
                    // Idle link; the loop head sends the heartbeat.
                }
                Some(FillOutcome::Eof) => {
                    return Err(SyncError::SourceConnection {
                        message: "replication stream closed".to_string(),
                    });
                }
            }
        }
    }

    async fn handle_command(
        &self,
        cmd: &StreamCommand,
        selected_db: &mut u32,
        out: &mpsc::Sender<ChangeEvent>,
    ) -> Result<()> {
        let name = cmd.name();

        if name == "SELECT" {
            if let Some(db) = cmd.arg_str(1).and_then(|s| s.parse().ok()) {
                *selected_db = db;
            }
            return Ok(());
        }
        if *selected_db != self.endpoint.db {
            // Traffic for a database we do not mirror.
            return Ok(());
        }

        match translate(cmd) {
            Translation::Apply(intents) => {
                metrics::record_stream_command(&name, true);
                for intent in intents {
                    let event = match intent {
                        Intent::Direct(record) => Some(ChangeEvent::write(record)),
                        Intent::Refresh(key) => self.refresh(&key).await?,
                        Intent::Tombstone(key) => Some(ChangeEvent::delete(key)),
                        Intent::Flush => Some(ChangeEvent::flush_all()),
                    };
                    if let Some(event) = event {
                        if let Some(limiter) = &self.limiter {
                            limiter.acquire().await;
                        }
                        if out.send(event).await.is_err() {
                            return Err(SyncError::Shutdown);
                        }
                    }
                }
            }
            Translation::Skip => {}
            Translation::Unknown => {
                metrics::record_stream_command(&name, false);
                debug!(command = %name, "Command not in translation table, skipped");
            }
        }
        Ok(())
    }

    /// Synthesize an event by re-reading the key on the source.
    async fn refresh(&self, key: &str) -> Result<Option<ChangeEvent>> {
        let mut conn = self.source.acquire().await?;
        match self.codec.read_key(&mut conn, key, self.source.op_timeout()).await? {
            ReadOutcome::Record(record) => Ok(Some(ChangeEvent::write(record))),
            ReadOutcome::Missing => Ok(Some(ChangeEvent::delete(key.to_string()))),
            ReadOutcome::Unsupported(type_name) => {
                debug!(key = %key, type_name = %type_name, "Skipping unreplicable type");
                Ok(None)
            }
        }
    }
}

impl ChangeDriver for PsyncDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Psync
    }

    fn run(
        mut self: Box<Self>,
        out: mpsc::Sender<ChangeEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> DriverFuture {
        Box::pin(async move {
            info!("PSYNC driver started");
            let mut backoff = BACKOFF_INITIAL;

            loop {
                if shutdown_requested(&shutdown) {
                    break;
                }

                match self.connect_and_stream(&out, &mut shutdown).await {
                    Ok(()) => break, // clean shutdown
                    Err(SyncError::Shutdown) => break,
                    Err(e @ (SyncError::Protocol(_) | SyncError::Auth { .. })) => {
                        self.handshake_failures += 1;
                        warn!(
                            error = %e,
                            failures = self.handshake_failures,
                            "Replication handshake rejected"
                        );
                        if self.handshake_failures >= MAX_HANDSHAKE_FAILURES {
                            warn!("Source does not speak PSYNC, downgrading to scan driver");
                            return Err(SyncError::Downgrade);
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, backoff_secs = backoff.as_secs(), "Replication link lost, backing off");
                    }
                }

                self.status.set_driver_state("backoff");
                metrics::record_driver_state("psync", "backoff");

                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(BACKOFF_MAX);
            }

            info!("PSYNC driver stopped");
            Ok(())
        })
    }
}

fn expect_reply(line: &str, want: &str) -> Result<()> {
    let line = line.trim_start_matches('\n');
    if line.starts_with(want) {
        Ok(())
    } else {
        Err(SyncError::Protocol(format!(
            "expected '{}', got '{}'",
            want, line
        )))
    }
}

async fn send_ack(link: &mut ReplLink, offset: u64) -> Result<()> {
    let offset_str = offset.to_string();
    link.send(&[b"REPLCONF", b"ACK", offset_str.as_bytes()]).await?;
    metrics::record_ack_sent();
    Ok(())
}

// =============================================================================
// Command translation
// =============================================================================

/// What one stream command means for replication.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Intent {
    /// Event fully determined by the command's own arguments.
    Direct(KeyRecord),
    /// Current state must be re-read from the source.
    Refresh(String),
    Tombstone(String),
    Flush,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Translation {
    Apply(Vec<Intent>),
    /// Recognized control traffic (PING, REPLCONF, MULTI, ...).
    Skip,
    /// Not in the table; logged and skipped.
    Unknown,
}

/// Translate one inline replication command into change intents.
///
/// The table is finite by design: string and TTL commands, the per-kind
/// mutators, stream appends, and the global flushes. Commands whose
/// resulting state cannot be derived from their arguments (counters,
/// aggregate mutations) synthesize the event by re-reading the key.
pub(crate) fn translate(cmd: &StreamCommand) -> Translation {
    let name = cmd.name();
    let key = |idx: usize| cmd.arg_str(idx);

    match name.as_str() {
        "SET" => translate_set(cmd),
        "SETEX" | "PSETEX" => {
            let (Some(key), Some(ttl), Some(value)) =
                (key(1), cmd.arg_str(2), cmd.args.get(3).cloned())
            else {
                return Translation::Unknown;
            };
            let Ok(ttl_num) = ttl.parse::<i64>() else {
                return Translation::Unknown;
            };
            let ttl_ms = if name == "SETEX" { ttl_num * 1000 } else { ttl_num };
            Translation::Apply(vec![Intent::Direct(KeyRecord {
                key,
                kind: KeyKind::String,
                value: KeyValue::Str(value),
                ttl_ms,
            })])
        }
        "SETNX" | "GETSET" => {
            let (Some(key), Some(value)) = (key(1), cmd.args.get(2).cloned()) else {
                return Translation::Unknown;
            };
            Translation::Apply(vec![Intent::Direct(KeyRecord {
                key,
                kind: KeyKind::String,
                value: KeyValue::Str(value),
                ttl_ms: 0,
            })])
        }
        "DEL" | "UNLINK" => {
            let tombstones: Vec<Intent> = cmd.args[1..]
                .iter()
                .map(|k| Intent::Tombstone(String::from_utf8_lossy(k).into_owned()))
                .collect();
            if tombstones.is_empty() {
                Translation::Unknown
            } else {
                Translation::Apply(tombstones)
            }
        }
        "GETDEL" => match key(1) {
            Some(key) => Translation::Apply(vec![Intent::Tombstone(key)]),
            None => Translation::Unknown,
        },
        "FLUSHDB" | "FLUSHALL" => Translation::Apply(vec![Intent::Flush]),
        "RENAME" => match (key(1), key(2)) {
            (Some(src), Some(dst)) => {
                Translation::Apply(vec![Intent::Tombstone(src), Intent::Refresh(dst)])
            }
            _ => Translation::Unknown,
        },
        "COPY" => match key(2) {
            Some(dst) => Translation::Apply(vec![Intent::Refresh(dst)]),
            None => Translation::Unknown,
        },
        // TTL mutations and value mutations whose outcome depends on
        // current state: re-read.
        "EXPIRE" | "PEXPIRE" | "EXPIREAT" | "PEXPIREAT" | "PERSIST" | "APPEND" | "INCR"
        | "DECR" | "INCRBY" | "DECRBY" | "INCRBYFLOAT" | "SETRANGE" | "HSET" | "HMSET"
        | "HSETNX" | "HDEL" | "HINCRBY" | "HINCRBYFLOAT" | "RPUSH" | "LPUSH" | "RPUSHX"
        | "LPUSHX" | "LPOP" | "RPOP" | "LSET" | "LREM" | "LTRIM" | "LINSERT" | "SADD"
        | "SREM" | "SPOP" | "ZADD" | "ZREM" | "ZINCRBY" | "ZREMRANGEBYSCORE"
        | "ZREMRANGEBYRANK" | "ZPOPMIN" | "ZPOPMAX" | "XADD" | "XDEL" | "XTRIM" | "XSETID" => {
            match key(1) {
                Some(key) => Translation::Apply(vec![Intent::Refresh(key)]),
                None => Translation::Unknown,
            }
        }
        "RPOPLPUSH" | "LMOVE" | "SMOVE" => match (key(1), key(2)) {
            (Some(src), Some(dst)) => {
                Translation::Apply(vec![Intent::Refresh(src), Intent::Refresh(dst)])
            }
            _ => Translation::Unknown,
        },
        "PING" | "REPLCONF" | "MULTI" | "EXEC" | "SELECT" => Translation::Skip,
        _ => Translation::Unknown,
    }
}

/// SET carries its own value and, usually, its own TTL.
fn translate_set(cmd: &StreamCommand) -> Translation {
    let (Some(key), Some(value)) = (cmd.arg_str(1), cmd.args.get(2).cloned()) else {
        return Translation::Unknown;
    };

    let mut ttl_ms: i64 = 0;
    let mut idx = 3;
    while idx < cmd.args.len() {
        let opt = cmd.arg_str(idx).unwrap_or_default().to_ascii_uppercase();
        match opt.as_str() {
            "EX" | "PX" | "EXAT" | "PXAT" => {
                let Some(raw) = cmd.arg_str(idx + 1).and_then(|s| s.parse::<i64>().ok()) else {
                    return Translation::Unknown;
                };
                ttl_ms = match opt.as_str() {
                    "EX" => raw * 1000,
                    "PX" => raw,
                    "EXAT" => raw * 1000 - epoch_millis() as i64,
                    _ => raw - epoch_millis() as i64,
                };
                idx += 2;
            }
            "KEEPTTL" => {
                // The surviving TTL lives on the source, not in the
                // command; synthesize instead.
                return Translation::Apply(vec![Intent::Refresh(key)]);
            }
            "NX" | "XX" | "GET" => idx += 1,
            _ => return Translation::Apply(vec![Intent::Refresh(key)]),
        }
    }

    if ttl_ms < 0 {
        // Absolute expiry already in the past.
        return Translation::Apply(vec![Intent::Tombstone(key)]);
    }

    Translation::Apply(vec![Intent::Direct(KeyRecord {
        key,
        kind: KeyKind::String,
        value: KeyValue::Str(value),
        ttl_ms,
    })])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(args: &[&str]) -> StreamCommand {
        StreamCommand {
            args: args.iter().map(|a| a.as_bytes().to_vec()).collect(),
            stream_bytes: 0,
        }
    }

    fn single_intent(translation: Translation) -> Intent {
        match translation {
            Translation::Apply(mut intents) if intents.len() == 1 => intents.remove(0),
            other => panic!("expected one intent, got {:?}", other),
        }
    }

    #[test]
    fn test_set_plain() {
        let intent = single_intent(translate(&cmd(&["SET", "user:1", "alice"])));
        match intent {
            Intent::Direct(record) => {
                assert_eq!(record.key, "user:1");
                assert_eq!(record.value, KeyValue::Str(b"alice".to_vec()));
                assert_eq!(record.ttl_ms, 0);
            }
            other => panic!("unexpected intent: {:?}", other),
        }
    }

    #[test]
    fn test_set_with_px() {
        let intent = single_intent(translate(&cmd(&["SET", "k", "v", "PX", "60000"])));
        match intent {
            Intent::Direct(record) => assert_eq!(record.ttl_ms, 60_000),
            other => panic!("unexpected intent: {:?}", other),
        }
    }

    #[test]
    fn test_set_with_ex() {
        let intent = single_intent(translate(&cmd(&["SET", "k", "v", "EX", "60"])));
        match intent {
            Intent::Direct(record) => assert_eq!(record.ttl_ms, 60_000),
            other => panic!("unexpected intent: {:?}", other),
        }
    }

    #[test]
    fn test_set_with_exat_future() {
        let at = (epoch_millis() / 1000 + 120).to_string();
        let intent = single_intent(translate(&cmd(&["SET", "k", "v", "EXAT", &at])));
        match intent {
            Intent::Direct(record) => {
                assert!(record.ttl_ms > 110_000 && record.ttl_ms <= 120_000);
            }
            other => panic!("unexpected intent: {:?}", other),
        }
    }

    #[test]
    fn test_set_with_exat_past_is_tombstone() {
        let intent = single_intent(translate(&cmd(&["SET", "k", "v", "EXAT", "1000"])));
        assert_eq!(intent, Intent::Tombstone("k".to_string()));
    }

    #[test]
    fn test_set_keepttl_refreshes() {
        let intent = single_intent(translate(&cmd(&["SET", "k", "v", "KEEPTTL"])));
        assert_eq!(intent, Intent::Refresh("k".to_string()));
    }

    #[test]
    fn test_set_nx_flag_ignored() {
        let intent = single_intent(translate(&cmd(&["SET", "k", "v", "NX"])));
        assert!(matches!(intent, Intent::Direct(_)));
    }

    #[test]
    fn test_setex_seconds() {
        let intent = single_intent(translate(&cmd(&["SETEX", "k", "30", "v"])));
        match intent {
            Intent::Direct(record) => assert_eq!(record.ttl_ms, 30_000),
            other => panic!("unexpected intent: {:?}", other),
        }
    }

    #[test]
    fn test_psetex_millis() {
        let intent = single_intent(translate(&cmd(&["PSETEX", "k", "1500", "v"])));
        match intent {
            Intent::Direct(record) => assert_eq!(record.ttl_ms, 1500),
            other => panic!("unexpected intent: {:?}", other),
        }
    }

    #[test]
    fn test_del_multiple_keys() {
        match translate(&cmd(&["DEL", "a", "b", "c"])) {
            Translation::Apply(intents) => {
                assert_eq!(
                    intents,
                    vec![
                        Intent::Tombstone("a".to_string()),
                        Intent::Tombstone("b".to_string()),
                        Intent::Tombstone("c".to_string()),
                    ]
                );
            }
            other => panic!("unexpected translation: {:?}", other),
        }
    }

    #[test]
    fn test_flushes() {
        assert_eq!(
            translate(&cmd(&["FLUSHDB"])),
            Translation::Apply(vec![Intent::Flush])
        );
        assert_eq!(
            translate(&cmd(&["FLUSHALL"])),
            Translation::Apply(vec![Intent::Flush])
        );
    }

    #[test]
    fn test_aggregate_mutations_refresh() {
        for args in [
            vec!["HSET", "h", "f", "v"],
            vec!["HDEL", "h", "f"],
            vec!["RPUSH", "l", "x"],
            vec!["LPOP", "l"],
            vec!["SADD", "s", "m"],
            vec!["SPOP", "s"],
            vec!["ZADD", "z", "1", "m"],
            vec!["ZINCRBY", "z", "2", "m"],
            vec!["XADD", "st", "*", "f", "v"],
            vec!["XTRIM", "st", "MAXLEN", "100"],
            vec!["EXPIRE", "k", "10"],
            vec!["PERSIST", "k"],
            vec!["INCR", "k"],
            vec!["APPEND", "k", "more"],
        ] {
            let name = args[0];
            let expected_key = args[1].to_string();
            let intent = single_intent(translate(&cmd(&args)));
            assert_eq!(intent, Intent::Refresh(expected_key), "command {}", name);
        }
    }

    #[test]
    fn test_two_key_commands_refresh_both() {
        match translate(&cmd(&["RPOPLPUSH", "src", "dst"])) {
            Translation::Apply(intents) => {
                assert_eq!(
                    intents,
                    vec![
                        Intent::Refresh("src".to_string()),
                        Intent::Refresh("dst".to_string())
                    ]
                );
            }
            other => panic!("unexpected translation: {:?}", other),
        }
    }

    #[test]
    fn test_rename_tombstones_source() {
        match translate(&cmd(&["RENAME", "old", "new"])) {
            Translation::Apply(intents) => {
                assert_eq!(
                    intents,
                    vec![
                        Intent::Tombstone("old".to_string()),
                        Intent::Refresh("new".to_string())
                    ]
                );
            }
            other => panic!("unexpected translation: {:?}", other),
        }
    }

    #[test]
    fn test_control_traffic_skipped() {
        for args in [
            vec!["PING"],
            vec!["REPLCONF", "GETACK", "*"],
            vec!["SELECT", "0"],
            vec!["MULTI"],
            vec!["EXEC"],
        ] {
            assert_eq!(translate(&cmd(&args)), Translation::Skip, "{:?}", args);
        }
    }

    #[test]
    fn test_unknown_commands() {
        assert_eq!(translate(&cmd(&["WAIT", "1", "100"])), Translation::Unknown);
        assert_eq!(translate(&cmd(&["EVALSHA", "abc", "0"])), Translation::Unknown);
        assert_eq!(translate(&cmd(&["DEL"])), Translation::Unknown);
    }

    #[test]
    fn test_expect_reply() {
        assert!(expect_reply("+OK", "+OK").is_ok());
        assert!(expect_reply("\n+OK", "+OK").is_ok());
        assert!(expect_reply("+PONG", "+OK").is_err());
        assert!(expect_reply("-ERR nope", "+OK").is_err());
    }

    #[test]
    fn test_cursor_equality() {
        let a = ReplicationCursor {
            replid: "abc".to_string(),
            offset: 10,
        };
        let b = a.clone();
        assert_eq!(a, b);
    }
}
