// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fan-out dispatcher: one change event in, N target applications out.
//!
//! Each target owns a dedicated pipeline task fed by a bounded queue, so
//! events are applied FIFO per target and one slow or broken target never
//! blocks dispatch to the others. A full queue is recorded as a failure
//! for that target rather than a stall.
//!
//! ```text
//!                      ┌─▶ [queue] ─▶ pipeline(t1): filter ok? ─▶ apply
//! driver ─▶ dedup ─▶ fan ─▶ [queue] ─▶ pipeline(t2): ...
//!                      └─▶ [queue] ─▶ pipeline(t3): ...
//! ```
//!
//! Dispatch consults the key filter and the dedup cache once per event,
//! then offers the event to every Active pipeline. Cooling and Disabled
//! targets are skipped entirely. Per-target failure accounting drives the
//! Active → Cooling → Active transitions in [`crate::failover`].
//!
//! In-flight payload bytes are tracked by a [`MemoryGauge`]; drivers pause
//! reads while the gauge sits above the configured ceiling, which is the
//! engine's backpressure mechanism.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::codec::{is_restore_version_mismatch, ReadOutcome, ValueCodec};
use crate::config::FailoverConfig;
use crate::dedup::DedupCache;
use crate::error::{Result, SyncError};
use crate::failover::{TargetHealth, TargetState};
use crate::filter::{KeyFilter, KeyProbe};
use crate::metrics;
use crate::record::{ChangeEvent, ChangeOp};
use crate::resilience::Bulkhead;
use crate::session::ManagedSession;
use crate::status::StatusBoard;

/// Boxed async result, the writer-trait seam.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// One application backend per target. The production implementation is
/// [`RedisTargetWriter`]; tests substitute recorders.
pub trait TargetWriter: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn apply(&self, event: Arc<TrackedEvent>) -> BoxFuture<'_, ()>;
}

/// Applies events to one target session via the value codec, with the
/// DUMP/RESTORE version-mismatch fallback re-reading from the source.
pub struct RedisTargetWriter {
    target: Arc<ManagedSession>,
    source: Arc<ManagedSession>,
    codec: ValueCodec,
}

impl RedisTargetWriter {
    pub fn new(target: Arc<ManagedSession>, source: Arc<ManagedSession>, codec: ValueCodec) -> Self {
        Self {
            target,
            source,
            codec,
        }
    }
}

impl TargetWriter for RedisTargetWriter {
    fn name(&self) -> &str {
        self.target.name()
    }

    fn apply(&self, event: Arc<TrackedEvent>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut conn = self.target.acquire().await?;
            let deadline = self.target.op_timeout();

            match self.codec.apply(&mut conn, &event.event, deadline).await {
                Ok(()) => {
                    self.target.record_success().await;
                    Ok(())
                }
                Err(e) if is_restore_version_mismatch(&e) => {
                    // Serialization versions disagree: re-read the key
                    // through the kind-specific path and retry once.
                    let key = event.event.op.key().unwrap_or_default().to_string();
                    debug!(target = %self.target.name(), key = %key, "RESTORE rejected, falling back to typed write");

                    let mut source_conn = self.source.acquire().await?;
                    let outcome = self
                        .codec
                        .read_key(&mut source_conn, &key, self.source.op_timeout())
                        .await?;
                    match outcome {
                        ReadOutcome::Record(record) => {
                            self.codec.write_record(&mut conn, &record, deadline).await?;
                            self.target.record_success().await;
                            Ok(())
                        }
                        ReadOutcome::Missing => {
                            let tombstone = ChangeEvent::delete(key);
                            self.codec.apply(&mut conn, &tombstone, deadline).await?;
                            self.target.record_success().await;
                            Ok(())
                        }
                        ReadOutcome::Unsupported(type_name) => Err(SyncError::Internal(format!(
                            "unreplicable type {} behind DUMP payload",
                            type_name
                        ))),
                    }
                }
                Err(e) => {
                    if e.is_retryable() {
                        self.target.record_failure().await;
                    }
                    Err(e)
                }
            }
        })
    }
}

// =============================================================================
// Memory gauge (backpressure)
// =============================================================================

/// Tracks bytes held by in-flight events. Drivers await
/// [`MemoryGauge::wait_below_limit()`] before reading more from the
/// source; the gauge wakes them as the dispatcher drains.
pub struct MemoryGauge {
    bytes: AtomicUsize,
    limit: usize,
    drained: Notify,
}

impl MemoryGauge {
    /// `limit` of 0 disables backpressure.
    pub fn new(limit: u64) -> Self {
        Self {
            bytes: AtomicUsize::new(0),
            limit: limit.min(usize::MAX as u64) as usize,
            drained: Notify::new(),
        }
    }

    pub fn current(&self) -> usize {
        self.bytes.load(Ordering::Acquire)
    }

    pub fn add(&self, n: usize) {
        let total = self.bytes.fetch_add(n, Ordering::AcqRel) + n;
        metrics::set_inflight_bytes(total);
    }

    pub fn sub(&self, n: usize) {
        let total = self.bytes.fetch_sub(n, Ordering::AcqRel).saturating_sub(n);
        metrics::set_inflight_bytes(total);
        if self.limit == 0 || total <= self.limit {
            self.drained.notify_waiters();
        }
    }

    /// Suspend until in-flight bytes fall to or below the limit.
    pub async fn wait_below_limit(&self) {
        if self.limit == 0 {
            return;
        }
        let start = Instant::now();
        let mut waited = false;
        loop {
            if self.bytes.load(Ordering::Acquire) <= self.limit {
                break;
            }
            waited = true;
            let notified = self.drained.notified();
            // Re-check after registering to avoid a missed wakeup.
            if self.bytes.load(Ordering::Acquire) <= self.limit {
                break;
            }
            notified.await;
        }
        if waited {
            metrics::record_backpressure_wait(start.elapsed());
        }
    }
}

/// A change event plus the gauge reservation it holds. The reservation is
/// released when the last pipeline drops its reference.
pub struct TrackedEvent {
    pub event: ChangeEvent,
    gauge: Arc<MemoryGauge>,
    size: usize,
}

impl Drop for TrackedEvent {
    fn drop(&mut self) {
        self.gauge.sub(self.size);
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Dispatcher tunables.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Per-target pipeline queue depth.
    pub queue_capacity: usize,
    pub failover: FailoverConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            failover: FailoverConfig::default(),
        }
    }
}

struct TargetHandle {
    name: String,
    tx: mpsc::Sender<Arc<TrackedEvent>>,
    health: Arc<TargetHealth>,
}

/// Fan-out dispatcher over per-target pipelines.
pub struct Dispatcher {
    handles: Vec<TargetHandle>,
    filter: Arc<KeyFilter>,
    dedup: Arc<DedupCache>,
    gauge: Arc<MemoryGauge>,
    status: Arc<StatusBoard>,
}

impl Dispatcher {
    /// Spawn one pipeline task per writer.
    pub fn new(
        writers: Vec<Arc<dyn TargetWriter>>,
        filter: Arc<KeyFilter>,
        dedup: Arc<DedupCache>,
        gauge: Arc<MemoryGauge>,
        status: Arc<StatusBoard>,
        bulkhead: Arc<Bulkhead>,
        config: DispatchConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let mut handles = Vec::with_capacity(writers.len());

        for writer in writers {
            let name = writer.name().to_string();
            let health = Arc::new(TargetHealth::new(name.clone(), config.failover.clone()));
            let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));

            let task_health = Arc::clone(&health);
            let task_status = Arc::clone(&status);
            let task_bulkhead = Arc::clone(&bulkhead);
            let task_shutdown = shutdown_rx.clone();
            let task_name = name.clone();
            tokio::spawn(async move {
                run_pipeline(writer, rx, task_health, task_status, task_bulkhead, task_shutdown).await;
                debug!(target = %task_name, "Pipeline stopped");
            });

            info!(target = %name, "Spawned target pipeline");
            handles.push(TargetHandle { name, tx, health });
        }

        Self {
            handles,
            filter,
            dedup,
            gauge,
            status,
        }
    }

    /// Filter + dedup gate; returns the trackable event if it should fan
    /// out.
    fn admit(&self, event: ChangeEvent) -> Option<Arc<TrackedEvent>> {
        match &event.op {
            ChangeOp::Write(record) => {
                let probe = KeyProbe {
                    key: &record.key,
                    ttl_ms: record.ttl_ms,
                    size_bytes: record.value.size_estimate() as u64,
                };
                if !self.filter.accept(&probe) {
                    return None;
                }
            }
            ChangeOp::Delete(key) => {
                if !self.filter.accept_key(key) {
                    return None;
                }
            }
            ChangeOp::FlushAll => {}
        }

        if !self.dedup.check_and_insert(event.fingerprint) {
            metrics::record_events_deduped(1);
            return None;
        }

        let size = event.op.size_estimate();
        self.gauge.add(size);
        Some(Arc::new(TrackedEvent {
            event,
            gauge: Arc::clone(&self.gauge),
            size,
        }))
    }

    /// Offer one event to every Active target without blocking.
    ///
    /// Returns `false` when the event was filtered out or suppressed by
    /// the dedup cache. Returns as soon as every per-target attempt has
    /// terminated (enqueued, recorded failure, or skipped).
    pub fn dispatch(&self, event: ChangeEvent) -> bool {
        let Some(tracked) = self.admit(event) else {
            return false;
        };

        for handle in &self.handles {
            let state = handle.health.effective_state();
            if let Some(stats) = self.status.target(&handle.name) {
                stats.set_state(state.to_string());
            }
            match state {
                TargetState::Active => match handle.tx.try_send(Arc::clone(&tracked)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        // A backed-up pipeline is a failed attempt, not a
                        // reason to stall the other targets.
                        metrics::record_queue_full(&handle.name);
                        handle.health.record_failure();
                        if let Some(stats) = self.status.target(&handle.name) {
                            stats.record_failed("pipeline queue full");
                            stats.set_state(handle.health.effective_state().to_string());
                        }
                    }
                    Err(TrySendError::Closed(_)) => {
                        warn!(target = %handle.name, "Pipeline gone, event skipped");
                    }
                },
                TargetState::Cooling | TargetState::Disabled => {
                    debug!(target = %handle.name, state = %state, "Target skipped");
                }
            }
        }

        true
    }

    /// Bulk-load variant used by the full-sync engine: waits for queue
    /// capacity instead of recording a failure, so a snapshot larger than
    /// the pipeline queues cannot shed keys.
    pub async fn offer(&self, event: ChangeEvent) -> bool {
        let Some(tracked) = self.admit(event) else {
            return false;
        };

        for handle in &self.handles {
            let state = handle.health.effective_state();
            if let Some(stats) = self.status.target(&handle.name) {
                stats.set_state(state.to_string());
            }
            if state != TargetState::Active {
                debug!(target = %handle.name, state = %state, "Target skipped");
                continue;
            }
            if handle.tx.send(Arc::clone(&tracked)).await.is_err() {
                warn!(target = %handle.name, "Pipeline gone, event skipped");
            }
        }

        true
    }

    /// Current per-target states (for the coordinator and tests).
    pub fn target_states(&self) -> Vec<(String, TargetState)> {
        self.handles
            .iter()
            .map(|h| (h.name.clone(), h.health.effective_state()))
            .collect()
    }

    /// Disable a target (config reload).
    pub fn disable_target(&self, name: &str) {
        for handle in &self.handles {
            if handle.name == name {
                handle.health.disable();
                if let Some(stats) = self.status.target(name) {
                    stats.set_state(TargetState::Disabled.to_string());
                }
            }
        }
    }

    pub fn gauge(&self) -> Arc<MemoryGauge> {
        Arc::clone(&self.gauge)
    }
}

async fn run_pipeline(
    writer: Arc<dyn TargetWriter>,
    mut rx: mpsc::Receiver<Arc<TrackedEvent>>,
    health: Arc<TargetHealth>,
    status: Arc<StatusBoard>,
    bulkhead: Arc<Bulkhead>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let name = writer.name().to_string();

    loop {
        let tracked = tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }

            maybe_event = rx.recv() => match maybe_event {
                Some(event) => event,
                None => break,
            },
        };

        // The queue may hold events accepted before the target tripped
        // into Cooling; drop them rather than hammer a failing endpoint.
        if health.effective_state() != TargetState::Active {
            continue;
        }

        let Ok(_permit) = bulkhead.acquire().await else {
            break;
        };

        let start = Instant::now();
        match writer.apply(Arc::clone(&tracked)).await {
            Ok(()) => {
                health.record_success();
                metrics::record_event_applied(&name);
                metrics::record_apply_latency(&name, start.elapsed());
                if let Some(stats) = status.target(&name) {
                    stats.record_applied();
                }
            }
            Err(e) => {
                // Rejected credentials never heal on their own; take the
                // target out of rotation instead of burning retries.
                if matches!(e, SyncError::Auth { .. }) {
                    health.disable();
                } else {
                    health.record_failure();
                }
                metrics::record_event_failed(&name, if e.is_retryable() { "transient" } else { "permanent" });
                warn!(target = %name, error = %e, "Apply failed");
                if let Some(stats) = status.target(&name) {
                    stats.record_failed(e.to_string());
                    stats.set_state(health.effective_state().to_string());
                }
            }
        }
    }
}
