//! Sync driver: periodic full resynchronization.
//!
//! Every interval the full-sync engine re-materializes the source into
//! the dispatcher's bulk path. Correctness is eventual and bandwidth use
//! is the worst of the three drivers, but there is nothing to go wrong:
//! no protocol, no heuristics.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use super::{shutdown_requested, ChangeDriver, DriverFuture};
use crate::config::{DriverKind, IncrementalConfig};
use crate::dispatch::Dispatcher;
use crate::fullsync::FullSyncEngine;
use crate::metrics;
use crate::record::ChangeEvent;
use crate::session::ManagedSession;
use crate::status::StatusBoard;

pub struct ResyncDriver {
    source: Arc<ManagedSession>,
    engine: Arc<FullSyncEngine>,
    dispatcher: Arc<Dispatcher>,
    config: IncrementalConfig,
    status: Arc<StatusBoard>,
}

impl ResyncDriver {
    pub fn new(
        source: Arc<ManagedSession>,
        engine: Arc<FullSyncEngine>,
        dispatcher: Arc<Dispatcher>,
        config: IncrementalConfig,
        status: Arc<StatusBoard>,
    ) -> Self {
        Self {
            source,
            engine,
            dispatcher,
            config,
            status,
        }
    }
}

impl ChangeDriver for ResyncDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Sync
    }

    // The resync driver feeds the dispatcher's bulk path directly; the
    // event channel stays idle.
    fn run(
        self: Box<Self>,
        _out: mpsc::Sender<ChangeEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> DriverFuture {
        Box::pin(async move {
            let interval = self.config.interval();
            info!(interval_secs = self.config.interval_secs, "Resync driver started");
            self.status.set_driver_state("resyncing");
            metrics::record_driver_state("sync", "resyncing");

            loop {
                if shutdown_requested(&shutdown) {
                    break;
                }

                match self.engine.run(&self.source, &self.dispatcher).await {
                    Ok(report) => {
                        metrics::record_events_emitted("sync", report.keys_dispatched);
                    }
                    Err(e) if e.is_retryable() => {
                        warn!(error = %e, "Resync pass failed, retrying next interval");
                    }
                    Err(e) => return Err(e),
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

            info!("Resync driver stopped");
            Ok(())
        })
    }
}
