//! # Mirror Engine
//!
//! A one-to-many Redis replication service: a single source instance is
//! continuously mirrored into N independently configured targets, over
//! links that may be long-haul, lossy, and high-latency.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                              mirror-engine                               │
//! │                                                                          │
//! │  ┌──────────────┐   ┌─────────────────────┐   ┌───────────────────────┐  │
//! │  │ Source       │──▶│ Incremental Engine  │──▶│ Dedup + Fan-out       │  │
//! │  │ Supervisor   │   │ (scan|sync|psync)   │   │ Dispatcher            │  │
//! │  └──────────────┘   └─────────────────────┘   └──────────┬────────────┘  │
//! │         │                                                │               │
//! │         ▼                                     per target ▼ (FIFO)        │
//! │  ┌──────────────┐                       ┌────────────────────────────┐   │
//! │  │ Full-Sync    │                       │ Filter ─▶ Codec ─▶ Target  │   │
//! │  │ Engine (RDB/ │──────────────────────▶│ Supervisor (×N, parallel)  │   │
//! │  │ scan walk)   │   bootstrap phase     └────────────────────────────┘   │
//! │  └──────────────┘                                                        │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Phases
//!
//! 1. **Full sync**: one-shot materialization of the source key space into
//!    each target (SCAN walk, SYNC snapshot, or DUMP/RESTORE).
//! 2. **Incremental**: ongoing change propagation through one of three
//!    interchangeable drivers: an IDLETIME-polling scan driver, a
//!    periodic-resync driver, or a PSYNC protocol replica with REPLCONF
//!    ACK heartbeats.
//!
//! One SCAN pass (or one replication stream) feeds every target; targets
//! fail over independently (Active → Cooling → Active) and one broken
//! link never blocks the others.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use mirror_engine::{MirrorEngine, SyncConfig, TargetConfig};
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SyncConfig::for_testing(vec![
//!         TargetConfig::for_testing("backup-1", 6380),
//!     ]);
//!     let (_tx, rx) = watch::channel(config.clone());
//!
//!     let mut engine = MirrorEngine::new(config, rx);
//!     engine.start().await.expect("failed to start");
//!
//!     // Engine runs until shutdown signal.
//!     engine.shutdown().await;
//! }
//! ```

pub mod codec;
pub mod config;
pub mod coordinator;
pub mod dedup;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod failover;
pub mod filter;
pub mod fullsync;
pub mod metrics;
pub mod rdb;
pub mod record;
pub mod replication;
pub mod resilience;
pub mod resp;
pub mod session;
pub mod status;
pub mod verify;

// Re-exports for convenience
pub use codec::{ReadOutcome, ValueCodec};
pub use config::{
    DriverKind, EndpointConfig, FilterConfig, FullSyncStrategy, SyncConfig, SyncMode, TargetConfig,
};
pub use coordinator::{EngineState, MirrorEngine};
pub use dedup::DedupCache;
pub use dispatch::{Dispatcher, TargetWriter};
pub use error::{Result, SyncError};
pub use failover::{TargetHealth, TargetState};
pub use filter::{KeyFilter, KeyProbe};
pub use fullsync::{FullSyncEngine, FullSyncReport};
pub use record::{ChangeEvent, ChangeOp, KeyKind, KeyRecord, KeyValue};
pub use session::{ManagedSession, SessionManager, SessionState};
pub use status::{StatusBoard, StatusSnapshot};
pub use verify::{SyncVerifier, TargetVerification, VerifyReport};
