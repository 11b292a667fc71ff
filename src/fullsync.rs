// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Full-sync engine: one-shot materialization of the source key space
//! into every target, through the same codec + dispatcher path the
//! incremental engine uses.
//!
//! Three strategies, selected by configuration:
//!
//! 1. **scan**: SCAN cursor walk; each key is probed, filtered, read
//!    through the per-kind codec, and dispatched as a synthetic change
//!    event. Stops when the cursor returns to 0.
//! 2. **sync**: raw SYNC on a replication link; the RDB payload streams
//!    through the structural parser, materialized records dispatch
//!    directly and the parser's fetch-hints are re-read via the codec.
//!    Sources that refuse replication commands fall back to `scan`.
//! 3. **dump_restore**: scan walk carrying opaque DUMP payloads, skipping
//!    the per-kind handlers.
//!
//! Ordering guarantee: every key present at scan start either lands at
//! its scan-time value or is superseded by a later incremental update.
//! Completion is signaled by the coordinator (full-sync-complete marker)
//! which gates the incremental engine in hybrid mode.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::codec::{ReadOutcome, ValueCodec};
use crate::config::{EndpointConfig, FilterConfig, FullSyncConfig, FullSyncStrategy};
use crate::dispatch::Dispatcher;
use crate::error::{Result, SyncError};
use crate::filter::KeyFilter;
use crate::metrics;
use crate::rdb::{RdbEntry, RdbEvent, RdbParser};
use crate::record::ChangeEvent;
use crate::replication::{RdbConduit, ReplLink};
use crate::session::ManagedSession;

/// Outcome of one full-sync pass.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FullSyncReport {
    pub strategy: &'static str,
    pub keys_dispatched: usize,
    pub keys_skipped: usize,
    pub keys_failed: usize,
    pub duration: Duration,
}

/// Materializes the source into the dispatcher.
pub struct FullSyncEngine {
    config: FullSyncConfig,
    source_endpoint: EndpointConfig,
    filter: Arc<KeyFilter>,
    codec: ValueCodec,
    /// With exactly one include pattern, SCAN can pre-filter server-side.
    match_hint: Option<String>,
}

impl FullSyncEngine {
    pub fn new(
        config: FullSyncConfig,
        source_endpoint: EndpointConfig,
        filters: &FilterConfig,
        filter: Arc<KeyFilter>,
    ) -> Self {
        let match_hint = match filters.include_patterns.as_slice() {
            [only] => Some(only.clone()),
            _ => None,
        };
        let codec = ValueCodec::new(config.preserve_ttl);
        Self {
            config,
            source_endpoint,
            filter,
            codec,
            match_hint,
        }
    }

    /// Run one full materialization pass.
    pub async fn run(
        &self,
        source: &Arc<ManagedSession>,
        dispatcher: &Dispatcher,
    ) -> Result<FullSyncReport> {
        let start = Instant::now();
        let mut report = match self.config.strategy {
            FullSyncStrategy::Scan => self.run_scan(source, dispatcher, false).await?,
            FullSyncStrategy::DumpRestore => self.run_scan(source, dispatcher, true).await?,
            FullSyncStrategy::Sync => match self.run_sync(source, dispatcher).await {
                Ok(report) => report,
                Err(e @ (SyncError::Protocol(_) | SyncError::RdbParse(_))) => {
                    // Managed sources refuse SYNC, and exotic payloads can
                    // defeat the structural parser; the scan walk always
                    // works.
                    warn!(error = %e, "SYNC materialization unavailable, falling back to scan");
                    self.run_scan(source, dispatcher, false).await?
                }
                Err(e) => return Err(e),
            },
        };
        report.duration = start.elapsed();

        metrics::record_full_sync(report.strategy, report.keys_dispatched, report.duration);
        info!(
            strategy = report.strategy,
            dispatched = report.keys_dispatched,
            skipped = report.keys_skipped,
            failed = report.keys_failed,
            duration_ms = report.duration.as_millis(),
            "Full sync complete"
        );
        Ok(report)
    }

    /// SCAN cursor walk; exactly one pass regardless of target count.
    async fn run_scan(
        &self,
        source: &Arc<ManagedSession>,
        dispatcher: &Dispatcher,
        use_dump: bool,
    ) -> Result<FullSyncReport> {
        let mut report = FullSyncReport {
            strategy: if use_dump { "dump_restore" } else { "scan" },
            ..Default::default()
        };

        let mut conn = source.acquire().await?;
        let deadline = source.op_timeout();
        let mut cursor: u64 = 0;

        loop {
            dispatcher.gauge().wait_below_limit().await;

            let mut cmd = redis::cmd("SCAN");
            cmd.arg(cursor);
            if let Some(pattern) = &self.match_hint {
                cmd.arg("MATCH").arg(pattern);
            }
            cmd.arg("COUNT").arg(self.config.batch_size);

            let scanned: (u64, Vec<Vec<u8>>) = match timeout(deadline, cmd.query_async(&mut conn)).await {
                Ok(Ok(reply)) => reply,
                Ok(Err(e)) => {
                    source.record_failure().await;
                    return Err(SyncError::redis("SCAN", e));
                }
                Err(_) => {
                    source.record_failure().await;
                    return Err(SyncError::redis_msg("SCAN", "deadline exceeded"));
                }
            };
            let (next_cursor, keys) = scanned;

            for raw_key in keys {
                let key = String::from_utf8_lossy(&raw_key).into_owned();
                if !self.filter.accept_key(&key) {
                    report.keys_skipped += 1;
                    continue;
                }

                let outcome = if use_dump {
                    self.codec.read_dump(&mut conn, &key, deadline).await
                } else {
                    self.codec.read_key(&mut conn, &key, deadline).await
                };

                match outcome {
                    Ok(ReadOutcome::Record(record)) => {
                        if dispatcher.offer(ChangeEvent::write(record)).await {
                            report.keys_dispatched += 1;
                        } else {
                            report.keys_skipped += 1;
                        }
                    }
                    Ok(ReadOutcome::Missing) => {
                        // Raced an expiry or delete mid-walk; the
                        // incremental phase owns the tombstone.
                        report.keys_skipped += 1;
                    }
                    Ok(ReadOutcome::Unsupported(type_name)) => {
                        debug!(key = %key, type_name = %type_name, "Skipping unreplicable type");
                        report.keys_skipped += 1;
                    }
                    Err(e) if e.is_retryable() => {
                        warn!(key = %key, error = %e, "Key read failed");
                        report.keys_failed += 1;
                    }
                    Err(e) => return Err(e),
                }
            }

            if next_cursor == 0 {
                break;
            }
            cursor = next_cursor;
        }

        source.record_success().await;
        Ok(report)
    }

    /// Raw SYNC: stream the RDB snapshot through the structural parser.
    async fn run_sync(
        &self,
        source: &Arc<ManagedSession>,
        dispatcher: &Dispatcher,
    ) -> Result<FullSyncReport> {
        let mut report = FullSyncReport {
            strategy: "sync",
            ..Default::default()
        };
        let deadline = self.source_endpoint.socket_timeout();

        let mut link = ReplLink::connect(&self.source_endpoint).await?;
        link.send(&[b"SYNC"]).await?;
        let framing = link.read_rdb_header(deadline).await?;
        info!(framing = ?framing, "SYNC accepted, consuming snapshot");

        let mut conduit = RdbConduit::new(framing);
        let mut parser = RdbParser::new();
        let mut needs_fetch: Vec<String> = Vec::new();

        while let Some(chunk) = link.next_rdb_chunk(&mut conduit, deadline).await? {
            parser.feed(&chunk);
            loop {
                match parser.next()? {
                    Some(RdbEvent::Entry(RdbEntry::Record(record))) => {
                        dispatcher.gauge().wait_below_limit().await;
                        let event = if record.is_tombstone() {
                            ChangeEvent::delete(record.key)
                        } else {
                            ChangeEvent::write(record)
                        };
                        if dispatcher.offer(event).await {
                            report.keys_dispatched += 1;
                        } else {
                            report.keys_skipped += 1;
                        }
                    }
                    Some(RdbEvent::Entry(RdbEntry::NeedsFetch { key })) => {
                        needs_fetch.push(key);
                    }
                    Some(RdbEvent::End) | None => break,
                }
            }
        }

        if !parser.is_finished() {
            return Err(SyncError::RdbParse("payload ended before EOF opcode".to_string()));
        }

        // Second pass: records the parser could not materialize are read
        // back through the per-kind codec.
        if !needs_fetch.is_empty() {
            debug!(count = needs_fetch.len(), "Re-reading compactly encoded keys");
            let mut conn = source.acquire().await?;
            let op_deadline = source.op_timeout();

            for key in needs_fetch {
                if !self.filter.accept_key(&key) {
                    report.keys_skipped += 1;
                    continue;
                }
                dispatcher.gauge().wait_below_limit().await;
                match self.codec.read_key(&mut conn, &key, op_deadline).await {
                    Ok(ReadOutcome::Record(record)) => {
                        if dispatcher.offer(ChangeEvent::write(record)).await {
                            report.keys_dispatched += 1;
                        } else {
                            report.keys_skipped += 1;
                        }
                    }
                    Ok(ReadOutcome::Missing) => report.keys_skipped += 1,
                    Ok(ReadOutcome::Unsupported(type_name)) => {
                        debug!(key = %key, type_name = %type_name, "Skipping unreplicable type");
                        report.keys_skipped += 1;
                    }
                    Err(e) if e.is_retryable() => {
                        warn!(key = %key, error = %e, "Refetch failed");
                        report.keys_failed += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(report)
    }
}
