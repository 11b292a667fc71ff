// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Incremental engine: three interchangeable change-event producers
//! behind one capability.
//!
//! - [`scan::ScanDriver`]: periodic SCAN + OBJECT IDLETIME polling with
//!   prior-keyset deletion detection. Works against any source.
//! - [`resync::ResyncDriver`]: periodic full resynchronization through
//!   the full-sync engine. Simplest, bandwidth-heavy.
//! - [`psync::PsyncDriver`]: replication-protocol consumer: handshake,
//!   FULLRESYNC/CONTINUE, inline command translation, REPLCONF ACK
//!   heartbeats, partial resync on reconnect.
//!
//! The coordinator owns one driver at a time; the fan-out dispatcher sees
//! a single producer regardless of which one is active. Drivers emit into
//! a bounded channel (or, for the resync driver, straight into the
//! dispatcher's bulk path) and honor the memory gauge before reading more
//! from the source.

pub mod psync;
pub mod resync;
pub mod scan;

use std::future::Future;
use std::pin::Pin;
use tokio::sync::{mpsc, watch};

use crate::config::DriverKind;
use crate::error::Result;
use crate::record::ChangeEvent;

/// Boxed run-loop future.
pub type DriverFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

/// One producer of change events.
///
/// `run` executes until shutdown (Ok) or a terminal error; returning
/// [`SyncError::Downgrade`](crate::error::SyncError::Downgrade) asks the
/// coordinator to swap in the scan driver.
pub trait ChangeDriver: Send + 'static {
    fn kind(&self) -> DriverKind;

    fn run(
        self: Box<Self>,
        out: mpsc::Sender<ChangeEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> DriverFuture;
}

/// Has the shutdown flag been raised?
pub(crate) fn shutdown_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}
