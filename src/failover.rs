//! Per-target health and failover state.
//!
//! ```text
//!              max_failures consecutive failures
//!    Active ───────────────────────────────────▶ Cooling
//!      ▲                                           │
//!      └────────── recovery_delay elapsed ─────────┘
//!
//!    Disabled: set from configuration; never left automatically.
//! ```
//!
//! A Cooling target is skipped by the dispatcher until its recovery timer
//! elapses, at which point it re-enters Active with the failure counter
//! reset. One success in Active also resets the counter. Transitions are
//! emitted as tracing events and metrics for the status surface.

use std::sync::Mutex;
use std::time::Instant;
use tracing::{info, warn};

use crate::config::FailoverConfig;
use crate::metrics;
use crate::record::epoch_millis;

/// Externally visible target state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    /// Participating in dispatch.
    Active,
    /// Skipped until the recovery timer elapses.
    Cooling,
    /// Turned off in configuration; skipped entirely.
    Disabled,
}

impl std::fmt::Display for TargetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetState::Active => write!(f, "active"),
            TargetState::Cooling => write!(f, "cooling"),
            TargetState::Disabled => write!(f, "disabled"),
        }
    }
}

#[derive(Debug)]
struct HealthInner {
    consecutive_failures: u32,
    last_failure_ms: Option<u64>,
    cooling_until: Option<Instant>,
    disabled: bool,
}

/// Failure counter + cooldown for one target. Cheap to query on every
/// dispatch; the lock is never held across I/O.
#[derive(Debug)]
pub struct TargetHealth {
    name: String,
    policy: FailoverConfig,
    inner: Mutex<HealthInner>,
}

impl TargetHealth {
    pub fn new(name: impl Into<String>, policy: FailoverConfig) -> Self {
        Self {
            name: name.into(),
            policy,
            inner: Mutex::new(HealthInner {
                consecutive_failures: 0,
                last_failure_ms: None,
                cooling_until: None,
                disabled: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, resolving an expired cooldown to Active (with the
    /// counter reset) as a side effect.
    pub fn effective_state(&self) -> TargetState {
        let mut inner = self.inner.lock().expect("health lock poisoned");
        if inner.disabled {
            return TargetState::Disabled;
        }
        if let Some(until) = inner.cooling_until {
            if Instant::now() < until {
                return TargetState::Cooling;
            }
            // Cooldown elapsed: back to Active, clean slate.
            inner.cooling_until = None;
            inner.consecutive_failures = 0;
            info!(target = %self.name, "Target recovered from cooling");
            metrics::record_target_state(&self.name, "active");
        }
        TargetState::Active
    }

    /// A successful apply resets the failure streak.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("health lock poisoned");
        inner.consecutive_failures = 0;
    }

    /// A failed apply; may trip the target into Cooling.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("health lock poisoned");
        inner.consecutive_failures += 1;
        inner.last_failure_ms = Some(epoch_millis());

        if !self.policy.enabled {
            return;
        }

        if inner.consecutive_failures >= self.policy.max_failures && inner.cooling_until.is_none() {
            inner.cooling_until = Some(Instant::now() + self.policy.recovery_delay());
            warn!(
                target = %self.name,
                failures = inner.consecutive_failures,
                recovery_delay_secs = self.policy.recovery_delay_secs,
                "Target entering cooling"
            );
            metrics::record_target_state(&self.name, "cooling");
        }
    }

    /// Mark the target Disabled (config reload removed it).
    pub fn disable(&self) {
        let mut inner = self.inner.lock().expect("health lock poisoned");
        if !inner.disabled {
            inner.disabled = true;
            info!(target = %self.name, "Target disabled");
            metrics::record_target_state(&self.name, "disabled");
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().expect("health lock poisoned").consecutive_failures
    }

    /// Epoch ms of the most recent failure, if any.
    pub fn last_failure_ms(&self) -> Option<u64> {
        self.inner.lock().expect("health lock poisoned").last_failure_ms
    }
}
