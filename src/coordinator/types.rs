//! Engine lifecycle state.
//!
//! # State Transitions
//!
//! ```text
//!                 start()
//! Created ─────────────────▶ Connecting ──▶ FullSync ──▶ Running
//!    │                           │              │            │
//!    │ (never started)           │ (no targets) │ (fatal)    │ shutdown()
//!    ↓                           ↓              ↓            ↓
//! Stopped ◀───────────────── Failed ◀──────────┘       ShuttingDown
//!    ▲                                                       │
//!    └───────────────────────────────────────────────────────┘
//! ```
//!
//! In `incremental` mode the FullSync phase is skipped; in `full` mode the
//! engine stays Running with no driver once materialization completes.

/// State of the mirror engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Created but not started.
    Created,
    /// Connecting to the source and targets.
    Connecting,
    /// Initial materialization in progress.
    FullSync,
    /// Steady state: driver feeding the fan-out dispatcher.
    Running,
    /// Graceful shutdown in progress; tasks draining.
    ShuttingDown,
    /// Shut down cleanly.
    Stopped,
    /// Unrecoverable error; check logs.
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Connecting => write!(f, "Connecting"),
            EngineState::FullSync => write!(f, "FullSync"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}
