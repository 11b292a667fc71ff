// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Scan driver: portable change detection by polling.
//!
//! Every interval the driver walks the source keyspace with one SCAN
//! cursor pass (exactly one per tick, regardless of target count), then
//! probes OBJECT IDLETIME in pipelined batches. A key whose idle time is
//! within `interval + ε` was touched since the last tick and is re-read
//! through the codec. Deletions are detected by diffing against the
//! previous tick's key set.
//!
//! Tradeoffs inherited from the polling approach: sub-interval overwrites
//! of one key collapse into one event, and an expiry is indistinguishable
//! from a delete. Workloads that need every write use the PSYNC driver.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{shutdown_requested, ChangeDriver, DriverFuture};
use crate::codec::{ReadOutcome, ValueCodec};
use crate::config::{DriverKind, IncrementalConfig};
use crate::dispatch::MemoryGauge;
use crate::error::{Result, SyncError};
use crate::filter::KeyFilter;
use crate::metrics;
use crate::record::ChangeEvent;
use crate::resilience::RateLimiter;
use crate::session::ManagedSession;
use crate::status::StatusBoard;

/// Idle-time slack added to the interval, covering clock skew and scan
/// duration (inherited from the source service's tolerance).
const IDLE_EPSILON_SECS: i64 = 5;

/// Pipeline batch for OBJECT IDLETIME probes.
const PROBE_BATCH: usize = 1000;

pub struct ScanDriver {
    source: Arc<ManagedSession>,
    config: IncrementalConfig,
    filter: Arc<KeyFilter>,
    codec: ValueCodec,
    gauge: Arc<MemoryGauge>,
    limiter: Option<Arc<RateLimiter>>,
    status: Arc<StatusBoard>,
    match_hint: Option<String>,
}

impl ScanDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<ManagedSession>,
        config: IncrementalConfig,
        filter: Arc<KeyFilter>,
        preserve_ttl: bool,
        gauge: Arc<MemoryGauge>,
        limiter: Option<Arc<RateLimiter>>,
        status: Arc<StatusBoard>,
        match_hint: Option<String>,
    ) -> Self {
        Self {
            source,
            config,
            filter,
            codec: ValueCodec::new(preserve_ttl),
            gauge,
            limiter,
            status,
            match_hint,
        }
    }

    async fn tick(
        &self,
        prior_keys: &mut HashSet<String>,
        out: &mpsc::Sender<ChangeEvent>,
    ) -> Result<()> {
        let start = Instant::now();
        let mut conn = self.source.acquire().await?;
        let deadline = self.source.op_timeout();

        // One cursor walk per tick feeds every target pipeline.
        let keys = self.scan_all(&mut conn, deadline).await?;
        let current: HashSet<String> = keys.iter().cloned().collect();

        // Deletion detection: keys that vanished since the previous walk.
        let mut deleted = 0usize;
        if !prior_keys.is_empty() {
            for gone in prior_keys.difference(&current) {
                if !self.filter.accept_key(gone) {
                    continue;
                }
                self.pace().await;
                if out.send(ChangeEvent::delete(gone.clone())).await.is_err() {
                    return Err(SyncError::Shutdown);
                }
                deleted += 1;
            }
        }

        // Touched-key detection via pipelined OBJECT IDLETIME.
        let idle_cutoff = self.config.interval_secs as i64 + IDLE_EPSILON_SECS;
        let mut changed = 0usize;

        'outer: for chunk in keys.chunks(PROBE_BATCH) {
            let idles = self.probe_idle_times(&mut conn, chunk, deadline).await;
            for (key, idle) in chunk.iter().zip(idles) {
                let Some(idle) = idle else { continue };
                if idle > idle_cutoff {
                    continue;
                }
                if !self.filter.accept_key(key) {
                    continue;
                }
                if changed >= self.config.max_changes_per_sync {
                    debug!(
                        max = self.config.max_changes_per_sync,
                        "Change cap reached, remainder picked up next tick"
                    );
                    break 'outer;
                }

                self.gauge.wait_below_limit().await;
                self.pace().await;

                let event = match self.codec.read_key(&mut conn, key, deadline).await? {
                    ReadOutcome::Record(record) => ChangeEvent::write(record),
                    ReadOutcome::Missing => ChangeEvent::delete(key.clone()),
                    ReadOutcome::Unsupported(type_name) => {
                        debug!(key = %key, type_name = %type_name, "Skipping unreplicable type");
                        continue;
                    }
                };
                if out.send(event).await.is_err() {
                    return Err(SyncError::Shutdown);
                }
                changed += 1;
            }
        }

        *prior_keys = current;
        self.source.record_success().await;
        metrics::record_scan_tick(changed, deleted, start.elapsed());
        metrics::record_events_emitted("scan", changed + deleted);
        if changed + deleted > 0 {
            info!(changed, deleted, duration_ms = start.elapsed().as_millis(), "Scan tick");
        } else {
            debug!(duration_ms = start.elapsed().as_millis(), "Scan tick, no changes");
        }
        Ok(())
    }

    async fn scan_all(
        &self,
        conn: &mut redis::aio::ConnectionManager,
        deadline: Duration,
    ) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let mut cmd = redis::cmd("SCAN");
            cmd.arg(cursor);
            if let Some(pattern) = &self.match_hint {
                cmd.arg("MATCH").arg(pattern);
            }
            cmd.arg("COUNT").arg(PROBE_BATCH);

            let (next, batch): (u64, Vec<Vec<u8>>) =
                match timeout(deadline, cmd.query_async(conn)).await {
                    Ok(Ok(reply)) => reply,
                    Ok(Err(e)) => {
                        self.source.record_failure().await;
                        return Err(SyncError::redis("SCAN", e));
                    }
                    Err(_) => {
                        self.source.record_failure().await;
                        return Err(SyncError::redis_msg("SCAN", "deadline exceeded"));
                    }
                };

            keys.extend(batch.iter().map(|k| String::from_utf8_lossy(k).into_owned()));
            if next == 0 {
                return Ok(keys);
            }
            cursor = next;
        }
    }

    /// Pipelined OBJECT IDLETIME for a chunk; falls back to per-key probes
    /// if the pipeline trips over a key deleted mid-flight.
    async fn probe_idle_times(
        &self,
        conn: &mut redis::aio::ConnectionManager,
        chunk: &[String],
        deadline: Duration,
    ) -> Vec<Option<i64>> {
        let mut pipe = redis::pipe();
        for key in chunk {
            pipe.cmd("OBJECT").arg("IDLETIME").arg(key);
        }

        let piped = timeout(deadline, async {
            let idles: Vec<i64> = pipe.query_async(conn).await?;
            Ok::<_, redis::RedisError>(idles)
        })
        .await;

        match piped {
            Ok(Ok(idles)) => idles.into_iter().map(Some).collect(),
            _ => {
                // A key evicted between SCAN and the probe fails the whole
                // pipeline; probe individually and skip the casualties.
                let mut out = Vec::with_capacity(chunk.len());
                for key in chunk {
                    let idle: Option<i64> = match timeout(
                        deadline,
                        redis::cmd("OBJECT").arg("IDLETIME").arg(key).query_async(conn),
                    )
                    .await
                    {
                        Ok(Ok(idle)) => idle,
                        _ => None,
                    };
                    out.push(idle);
                }
                out
            }
        }
    }

    async fn pace(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }
    }
}

impl ChangeDriver for ScanDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Scan
    }

    fn run(
        self: Box<Self>,
        out: mpsc::Sender<ChangeEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> DriverFuture {
        Box::pin(async move {
            let interval = self.config.interval();
            info!(interval_secs = self.config.interval_secs, "Scan driver started");
            self.status.set_driver_state("polling");
            metrics::record_driver_state("scan", "polling");

            let mut prior_keys = HashSet::new();

            loop {
                if shutdown_requested(&shutdown) {
                    break;
                }

                if let Err(e) = self.tick(&mut prior_keys, &out).await {
                    match e {
                        SyncError::Shutdown => break,
                        e if e.is_retryable() => {
                            warn!(error = %e, "Scan tick failed, retrying next interval");
                        }
                        e => return Err(e),
                    }
                }

                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }

            info!("Scan driver stopped");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_cutoff_math() {
        // 30s interval + 5s epsilon: a key idle 35s still counts.
        let config = IncrementalConfig::default();
        let cutoff = config.interval_secs as i64 + IDLE_EPSILON_SECS;
        assert_eq!(cutoff, 35);
        assert!(34 <= cutoff);
        assert!(36 > cutoff);
    }

    #[test]
    fn test_probe_batch_reasonable() {
        assert!(PROBE_BATCH >= 100);
        assert!(PROBE_BATCH <= 10_000);
    }
}
