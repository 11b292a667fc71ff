// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory status surface consumed by the external HTTP view.
//!
//! Counters use atomics and state strings sit behind short mutexes; no
//! lock is ever held across I/O, and [`StatusBoard::snapshot()`] performs
//! no network calls. The snapshot is `serde`-serializable so the HTTP
//! layer can render it directly.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Live counters for one target.
#[derive(Debug, Default)]
pub struct TargetStats {
    applied: AtomicU64,
    failed: AtomicU64,
    consecutive_failures: AtomicU32,
    state: Mutex<String>,
    last_error: Mutex<Option<String>>,
}

impl TargetStats {
    pub fn record_applied(&self) {
        self.applied.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub fn record_failed(&self, error: impl Into<String>) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock().expect("status lock poisoned") = Some(error.into());
    }

    pub fn set_state(&self, state: impl Into<String>) {
        *self.state.lock().expect("status lock poisoned") = state.into();
    }

    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Snapshot of one target's stats.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TargetStatus {
    pub name: String,
    pub state: String,
    pub applied: u64,
    pub failed: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

/// Snapshot of the whole engine, cheap to produce.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub source_state: String,
    pub driver: String,
    pub driver_state: String,
    pub full_sync_complete: bool,
    pub replication_id: Option<String>,
    pub replication_offset: Option<u64>,
    pub targets: Vec<TargetStatus>,
}

/// Shared mutable status. One instance per engine, cloned by reference
/// into every task that reports progress.
pub struct StatusBoard {
    source_state: Mutex<String>,
    driver: Mutex<String>,
    driver_state: Mutex<String>,
    full_sync_complete: AtomicBool,
    replication_id: Mutex<Option<String>>,
    replication_offset: AtomicU64,
    has_offset: AtomicBool,
    targets: HashMap<String, Arc<TargetStats>>,
}

impl StatusBoard {
    /// Build the board with one stats slot per target name.
    pub fn new(target_names: impl IntoIterator<Item = String>) -> Self {
        let targets = target_names
            .into_iter()
            .map(|name| {
                let stats = TargetStats::default();
                stats.set_state("active");
                (name, Arc::new(stats))
            })
            .collect();

        Self {
            source_state: Mutex::new("reconnecting".to_string()),
            driver: Mutex::new("none".to_string()),
            driver_state: Mutex::new("idle".to_string()),
            full_sync_complete: AtomicBool::new(false),
            replication_id: Mutex::new(None),
            replication_offset: AtomicU64::new(0),
            has_offset: AtomicBool::new(false),
            targets,
        }
    }

    pub fn target(&self, name: &str) -> Option<Arc<TargetStats>> {
        self.targets.get(name).map(Arc::clone)
    }

    pub fn set_source_state(&self, state: impl Into<String>) {
        *self.source_state.lock().expect("status lock poisoned") = state.into();
    }

    pub fn set_driver(&self, driver: impl Into<String>) {
        *self.driver.lock().expect("status lock poisoned") = driver.into();
    }

    pub fn set_driver_state(&self, state: impl Into<String>) {
        *self.driver_state.lock().expect("status lock poisoned") = state.into();
    }

    pub fn set_full_sync_complete(&self) {
        self.full_sync_complete.store(true, Ordering::Release);
    }

    pub fn full_sync_complete(&self) -> bool {
        self.full_sync_complete.load(Ordering::Acquire)
    }

    /// Record the PSYNC cursor for the status view.
    pub fn set_replication_cursor(&self, replid: &str, offset: u64) {
        *self.replication_id.lock().expect("status lock poisoned") = Some(replid.to_string());
        self.replication_offset.store(offset, Ordering::Relaxed);
        self.has_offset.store(true, Ordering::Release);
    }

    pub fn set_replication_offset(&self, offset: u64) {
        self.replication_offset.store(offset, Ordering::Relaxed);
        self.has_offset.store(true, Ordering::Release);
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let mut targets: Vec<TargetStatus> = self
            .targets
            .iter()
            .map(|(name, stats)| TargetStatus {
                name: name.clone(),
                state: stats.state.lock().expect("status lock poisoned").clone(),
                applied: stats.applied.load(Ordering::Relaxed),
                failed: stats.failed.load(Ordering::Relaxed),
                consecutive_failures: stats.consecutive_failures.load(Ordering::Relaxed),
                last_error: stats.last_error.lock().expect("status lock poisoned").clone(),
            })
            .collect();
        targets.sort_by(|a, b| a.name.cmp(&b.name));

        StatusSnapshot {
            source_state: self.source_state.lock().expect("status lock poisoned").clone(),
            driver: self.driver.lock().expect("status lock poisoned").clone(),
            driver_state: self.driver_state.lock().expect("status lock poisoned").clone(),
            full_sync_complete: self.full_sync_complete.load(Ordering::Acquire),
            replication_id: self.replication_id.lock().expect("status lock poisoned").clone(),
            replication_offset: if self.has_offset.load(Ordering::Acquire) {
                Some(self.replication_offset.load(Ordering::Relaxed))
            } else {
                None
            },
            targets,
        }
    }
}
