// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine coordinator.
//!
//! Ties the pieces together and owns the task lifecycle:
//! 1. Validates the configuration (rejection is fatal, exit 2).
//! 2. Connects the source with a bounded startup policy (exhaustion is
//!    exit 3) and the targets with the configured bounded backoff.
//! 3. Spawns per-target pipelines, the health tick, and (per mode) the
//!    full-sync pass and one incremental driver.
//! 4. On shutdown, signals every task and drains them within a grace
//!    period before closing sessions.
//!
//! The full-sync-complete marker gates the incremental driver in hybrid
//! mode: the driver task is only spawned after materialization finishes.
//! A PSYNC driver that gives up ([`SyncError::Downgrade`]) is replaced by
//! the scan driver in place, without restarting the engine.

mod types;

pub use types::EngineState;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::{DriverKind, SyncConfig, SyncMode};
use crate::dedup::DedupCache;
use crate::dispatch::{
    DispatchConfig, Dispatcher, MemoryGauge, RedisTargetWriter, TargetWriter,
};
use crate::driver::psync::PsyncDriver;
use crate::driver::resync::ResyncDriver;
use crate::driver::scan::ScanDriver;
use crate::driver::ChangeDriver;
use crate::error::{Result, SyncError};
use crate::filter::KeyFilter;
use crate::fullsync::FullSyncEngine;
use crate::metrics;
use crate::resilience::{Bulkhead, RateLimitConfig, RateLimiter, RetryConfig};
use crate::session::{ManagedSession, SessionManager, SessionState};
use crate::status::{StatusBoard, StatusSnapshot};
use crate::verify::SyncVerifier;

/// Grace period for task drain during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Health tick cadence.
const HEALTH_TICK: Duration = Duration::from_secs(30);

/// Driver → dispatcher channel depth.
const EVENT_CHANNEL_DEPTH: usize = 1024;

/// The one-to-many mirror engine.
pub struct MirrorEngine {
    config: SyncConfig,

    /// Runtime config updates (target disabling).
    config_rx: watch::Receiver<SyncConfig>,

    state_tx: Arc<watch::Sender<EngineState>>,
    state_rx: watch::Receiver<EngineState>,

    sessions: Arc<SessionManager>,
    status: Arc<StatusBoard>,
    dispatcher: Arc<RwLock<Option<Arc<Dispatcher>>>>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    task_handles: RwLock<Vec<tokio::task::JoinHandle<()>>>,
}

impl MirrorEngine {
    /// Create the engine in `Created` state. Call [`start()`](Self::start)
    /// to connect and begin mirroring.
    pub fn new(config: SyncConfig, config_rx: watch::Receiver<SyncConfig>) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let state_tx = Arc::new(state_tx);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let target_retry = RetryConfig::from_settings(
            &config.service.retry,
            config.source.connect_timeout(),
        );
        let sessions = Arc::new(SessionManager::new(
            config.source.clone(),
            &config.targets,
            target_retry,
        ));

        let status = Arc::new(StatusBoard::new(
            config.enabled_targets().map(|t| t.name.clone()),
        ));

        Self {
            config,
            config_rx,
            state_tx,
            state_rx,
            sessions,
            status,
            dispatcher: Arc::new(RwLock::new(None)),
            shutdown_tx,
            shutdown_rx,
            task_handles: RwLock::new(Vec::new()),
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    /// Point-in-time status for the external HTTP view. No I/O.
    pub fn status(&self) -> StatusSnapshot {
        self.status.snapshot()
    }

    /// Start the engine: connect, materialize, stream.
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(SyncError::Internal(format!(
                "start() in state {}",
                self.state()
            )));
        }

        self.config.validate()?;
        let filter = Arc::new(KeyFilter::new(&self.config.filters)?);

        let _ = self.state_tx.send(EngineState::Connecting);
        metrics::set_engine_state("Connecting");
        info!(
            source = %self.config.source.address(),
            targets = self.config.targets.len(),
            mode = ?self.config.sync.mode,
            "Starting mirror engine"
        );

        // Source first: nothing works without it. Bounded retry at start
        // so a dead source surfaces as exit 3.
        let source = self.sessions.source();
        source
            .connect_with(&RetryConfig::startup())
            .await
            .map_err(|e| match e {
                SyncError::Auth { .. } | SyncError::Config(_) => e,
                other => SyncError::SourceConnection {
                    message: other.to_string(),
                },
            })?;
        self.status.set_source_state("healthy");

        // Targets: individual failures are tolerated (their supervisors
        // keep retrying), but starting with zero live targets is an error.
        let connected = self.sessions.connect_targets().await;
        if connected == 0 {
            error!("No target connected");
            let _ = self.state_tx.send(EngineState::Failed);
            metrics::set_engine_state("Failed");
            return Err(SyncError::Internal("no targets connected".to_string()));
        }
        info!(connected, total = self.config.targets.len(), "Targets connected");

        // Wire the fan-out path.
        let incremental = &self.config.sync.incremental_sync;
        let dedup_window = dedup_window_for(incremental.interval_secs);
        let dedup = Arc::new(DedupCache::new(crate::dedup::DEFAULT_CAPACITY, dedup_window));
        let gauge = Arc::new(MemoryGauge::new(
            self.config.service.performance.memory_limit_bytes,
        ));
        let bulkhead = Arc::new(Bulkhead::new(self.config.service.performance.max_workers));
        let codec = crate::codec::ValueCodec::new(self.config.sync.full_sync.preserve_ttl);

        let writers: Vec<Arc<dyn TargetWriter>> = self
            .sessions
            .targets()
            .into_iter()
            .map(|session| {
                Arc::new(RedisTargetWriter::new(session, self.sessions.source(), codec))
                    as Arc<dyn TargetWriter>
            })
            .collect();

        let dispatcher = Arc::new(Dispatcher::new(
            writers,
            Arc::clone(&filter),
            dedup,
            Arc::clone(&gauge),
            Arc::clone(&self.status),
            bulkhead,
            DispatchConfig {
                queue_capacity: EVENT_CHANNEL_DEPTH,
                failover: self.config.service.failover.clone(),
            },
            self.shutdown_rx.clone(),
        ));
        *self.dispatcher.write().await = Some(Arc::clone(&dispatcher));

        self.spawn_health_tick();
        self.spawn_config_watch(Arc::clone(&dispatcher));

        // Full-sync phase.
        let full_engine = Arc::new(FullSyncEngine::new(
            self.config.sync.full_sync.clone(),
            self.config.source.clone(),
            &self.config.filters,
            Arc::clone(&filter),
        ));

        if matches!(self.config.sync.mode, SyncMode::Full | SyncMode::Hybrid) {
            let _ = self.state_tx.send(EngineState::FullSync);
            metrics::set_engine_state("FullSync");

            full_engine.run(&source, &dispatcher).await?;
            self.status.set_full_sync_complete();

            if self.config.sync.full_sync.verify_migration {
                self.verify_full_sync(&source, &filter).await;
            }
        }

        // Incremental phase, gated on the completion marker above.
        if matches!(self.config.sync.mode, SyncMode::Incremental | SyncMode::Hybrid)
            && incremental.enabled
        {
            self.spawn_incremental(
                Arc::clone(&dispatcher),
                Arc::clone(&filter),
                Arc::clone(&gauge),
                Arc::clone(&full_engine),
            );
        }

        let _ = self.state_tx.send(EngineState::Running);
        metrics::set_engine_state("Running");
        info!("Mirror engine running");
        Ok(())
    }

    /// Sampled source/target comparison after materialization.
    ///
    /// Non-fatal: a divergent target is recorded against the status
    /// surface and healed by the incremental phase, not aborted on.
    async fn verify_full_sync(&self, source: &Arc<ManagedSession>, filter: &Arc<KeyFilter>) {
        let match_hint = match self.config.filters.include_patterns.as_slice() {
            [only] => Some(only.clone()),
            _ => None,
        };
        let verifier = SyncVerifier::new(self.config.sync.full_sync.verify_sample_size, match_hint);

        match verifier.verify(source, &self.sessions.targets(), filter).await {
            Ok(report) => {
                for divergent in report.failed_targets() {
                    if let Some(stats) = self.status.target(&divergent.target) {
                        stats.record_failed(format!(
                            "verification: {}/{} sampled keys matched",
                            divergent.matched, divergent.sampled
                        ));
                    }
                }
                if report.all_passed() {
                    info!(
                        targets = report.targets.len(),
                        duration_ms = report.duration.as_millis(),
                        "Full-sync verification passed"
                    );
                } else {
                    warn!(
                        divergent = report.failed_targets().count(),
                        "Full-sync verification found divergent targets"
                    );
                }
            }
            Err(e) => {
                warn!(error = %e, "Full-sync verification could not run");
            }
        }
    }

    /// Health tick: PING every session, demote failures, give Broken
    /// sessions a fresh chance.
    fn spawn_health_tick(&self) {
        let sessions = Arc::clone(&self.sessions);
        let status = Arc::clone(&self.status);
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(HEALTH_TICK);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let mut all = sessions.targets();
                        all.push(sessions.source());
                        for session in all {
                            match session.state().await {
                                SessionState::Healthy => {
                                    if let Err(e) = session.ping().await {
                                        warn!(session = %session.name(), error = %e, "Health ping failed");
                                    }
                                }
                                SessionState::Broken => {
                                    // One reconnect opportunity per tick.
                                    session.revive().await;
                                }
                                SessionState::Reconnecting => {
                                    if let Err(e) = session.connect().await {
                                        debug!(session = %session.name(), error = %e, "Reconnect attempt failed");
                                    }
                                }
                            }
                        }
                        let source_state = sessions.source().state().await;
                        status.set_source_state(source_state.to_string());
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("Health tick stopping");
                            break;
                        }
                    }
                }
            }
        });

        debug!("Spawned health tick");
        self.spawn_bookkeeping(handle);
    }

    /// Watch for config updates that disable targets.
    fn spawn_config_watch(&self, dispatcher: Arc<Dispatcher>) {
        let mut config_rx = self.config_rx.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = config_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let updated = config_rx.borrow().clone();
                        for target in updated.targets.iter().filter(|t| !t.enabled) {
                            info!(target = %target.name, "Target disabled by config reload");
                            dispatcher.disable_target(&target.name);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        self.spawn_bookkeeping(handle);
    }

    /// Spawn the incremental driver plus the channel consumer feeding the
    /// dispatcher. A PSYNC downgrade swaps in the scan driver in place.
    fn spawn_incremental(
        &self,
        dispatcher: Arc<Dispatcher>,
        filter: Arc<KeyFilter>,
        gauge: Arc<MemoryGauge>,
        full_engine: Arc<FullSyncEngine>,
    ) {
        let config = self.config.clone();
        let sessions = Arc::clone(&self.sessions);
        let status = Arc::clone(&self.status);
        let shutdown_rx = self.shutdown_rx.clone();
        let state_tx = Arc::clone(&self.state_tx);

        let (event_tx, mut event_rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);

        // Consumer: the dispatcher sees one producer regardless of driver.
        let consumer_dispatcher = Arc::clone(&dispatcher);
        let consumer = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                consumer_dispatcher.dispatch(event);
            }
            debug!("Event consumer stopped");
        });
        self.spawn_bookkeeping(consumer);

        let producer = tokio::spawn(async move {
            let incremental = config.sync.incremental_sync.clone();
            let limiter = incremental
                .rate_limit_per_sec
                .map(|rate| Arc::new(RateLimiter::new(RateLimitConfig::per_second(rate))));
            let match_hint = match config.filters.include_patterns.as_slice() {
                [only] => Some(only.clone()),
                _ => None,
            };
            let preserve_ttl = config.sync.full_sync.preserve_ttl;
            let mut kind = incremental.driver;

            loop {
                status.set_driver(kind.to_string());
                let driver: Box<dyn ChangeDriver> = match kind {
                    DriverKind::Scan => Box::new(ScanDriver::new(
                        sessions.source(),
                        incremental.clone(),
                        Arc::clone(&filter),
                        preserve_ttl,
                        Arc::clone(&gauge),
                        limiter.clone(),
                        Arc::clone(&status),
                        match_hint.clone(),
                    )),
                    DriverKind::Sync => Box::new(ResyncDriver::new(
                        sessions.source(),
                        Arc::clone(&full_engine),
                        Arc::clone(&dispatcher),
                        incremental.clone(),
                        Arc::clone(&status),
                    )),
                    DriverKind::Psync => Box::new(PsyncDriver::new(
                        config.source.clone(),
                        sessions.source(),
                        incremental.clone(),
                        preserve_ttl,
                        Arc::clone(&gauge),
                        limiter.clone(),
                        Arc::clone(&status),
                    )),
                };

                match driver.run(event_tx.clone(), shutdown_rx.clone()).await {
                    Ok(()) => break,
                    Err(SyncError::Downgrade) => {
                        warn!("Downgrading incremental driver to scan");
                        kind = DriverKind::Scan;
                    }
                    Err(e) => {
                        error!(error = %e, "Incremental driver failed irrecoverably");
                        status.set_driver_state("failed");
                        let _ = state_tx.send(EngineState::Failed);
                        metrics::set_engine_state("Failed");
                        break;
                    }
                }
            }
            debug!("Driver task stopped");
        });
        self.spawn_bookkeeping(producer);
    }

    fn spawn_bookkeeping(&self, handle: tokio::task::JoinHandle<()>) {
        // try_write never contends here: handles are only added from
        // start(), before tasks could race on shutdown.
        if let Ok(mut handles) = self.task_handles.try_write() {
            handles.push(handle);
        }
    }

    /// Graceful shutdown: signal, drain within the grace period, close.
    pub async fn shutdown(&mut self) {
        info!("Shutting down mirror engine");
        let _ = self.state_tx.send(EngineState::ShuttingDown);
        metrics::set_engine_state("ShuttingDown");

        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = {
            let mut guard = self.task_handles.write().await;
            std::mem::take(&mut *guard)
        };

        let task_count = handles.len();
        if task_count > 0 {
            info!(task_count, "Draining tasks");
        }

        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task drained"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => warn!(task = i + 1, "Task exceeded shutdown grace, aborted"),
            }
        }

        self.sessions.shutdown_all();
        *self.dispatcher.write().await = None;

        let _ = self.state_tx.send(EngineState::Stopped);
        metrics::set_engine_state("Stopped");
        info!("Mirror engine stopped");
    }
}

/// Dedup window: shorter than the incremental interval by construction so
/// a real subsequent write is never suppressed.
fn dedup_window_for(interval_secs: u64) -> Duration {
    let half_interval = Duration::from_millis(interval_secs.saturating_mul(1000) / 2);
    crate::dedup::DEFAULT_WINDOW.min(half_interval.max(Duration::from_millis(250)))
}
