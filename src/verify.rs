// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Post-sync verification: sampled comparison of source and targets.
//!
//! After a full materialization, a sample of source keys is probed on
//! each target with pipelined EXISTS + TYPE. A key counts as matched when
//! it exists on the target with the same type; a target passes when its
//! match rate reaches [`MATCH_THRESHOLD`]. The pass is a spot check, not
//! a proof: values are not compared, and keys written or expired during
//! the sample legitimately diverge, which is why the gate sits at 95%
//! rather than 100%.
//!
//! Verification never mutates anything. A failing target is reported
//! against the status surface and left to the incremental phase (or the
//! next resync) to converge; the engine does not abort.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::error::{Result, SyncError};
use crate::filter::KeyFilter;
use crate::metrics;
use crate::session::ManagedSession;

/// Minimum match rate for a target to pass verification.
pub const MATCH_THRESHOLD: f64 = 0.95;

/// Pipeline chunk for the EXISTS/TYPE probes.
const PROBE_CHUNK: usize = 100;

/// Comparison outcome for one target.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetVerification {
    pub target: String,
    /// Keys sampled from the source.
    pub sampled: usize,
    /// Present on the target with the same type.
    pub matched: usize,
    /// Absent on the target.
    pub missing: usize,
    /// Present but with a different type.
    pub kind_mismatch: usize,
}

impl TargetVerification {
    /// Fraction of sampled keys that matched. An empty sample is a pass.
    pub fn match_rate(&self) -> f64 {
        if self.sampled == 0 {
            1.0
        } else {
            self.matched as f64 / self.sampled as f64
        }
    }

    pub fn passed(&self) -> bool {
        self.match_rate() >= MATCH_THRESHOLD
    }
}

/// Outcome of one verification pass over all targets.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifyReport {
    pub targets: Vec<TargetVerification>,
    pub duration: Duration,
}

impl VerifyReport {
    pub fn all_passed(&self) -> bool {
        self.targets.iter().all(|t| t.passed())
    }

    pub fn failed_targets(&self) -> impl Iterator<Item = &TargetVerification> {
        self.targets.iter().filter(|t| !t.passed())
    }
}

/// Sampled source/target comparator.
pub struct SyncVerifier {
    sample_size: usize,
    /// With exactly one include pattern, SCAN can pre-filter server-side.
    match_hint: Option<String>,
}

impl SyncVerifier {
    pub fn new(sample_size: usize, match_hint: Option<String>) -> Self {
        Self {
            sample_size: sample_size.max(1),
            match_hint,
        }
    }

    /// Sample the source and compare the sample against every target.
    ///
    /// Targets whose session cannot be borrowed are reported with an
    /// all-missing sample rather than failing the whole pass; one dead
    /// link must not hide the healthy targets' results.
    pub async fn verify(
        &self,
        source: &Arc<ManagedSession>,
        targets: &[Arc<ManagedSession>],
        filter: &KeyFilter,
    ) -> Result<VerifyReport> {
        let start = Instant::now();

        let mut source_conn = source.acquire().await?;
        let deadline = source.op_timeout();

        let keys = self.sample_keys(&mut source_conn, deadline, filter).await?;
        let source_kinds = probe_kinds(&mut source_conn, &keys, deadline, "source").await?;

        let mut results = Vec::with_capacity(targets.len());
        for target in targets {
            let verification = match target.acquire().await {
                Ok(mut conn) => {
                    self.compare_target(target.name(), &mut conn, target.op_timeout(), &keys, &source_kinds)
                        .await?
                }
                Err(e) => {
                    warn!(target = %target.name(), error = %e, "Target unreachable for verification");
                    TargetVerification {
                        target: target.name().to_string(),
                        sampled: keys.len(),
                        matched: 0,
                        missing: keys.len(),
                        kind_mismatch: 0,
                    }
                }
            };

            metrics::record_verification(
                &verification.target,
                verification.sampled,
                verification.matched,
                verification.passed(),
            );
            if verification.passed() {
                info!(
                    target = %verification.target,
                    sampled = verification.sampled,
                    matched = verification.matched,
                    rate = verification.match_rate(),
                    "Verification passed"
                );
            } else {
                warn!(
                    target = %verification.target,
                    sampled = verification.sampled,
                    matched = verification.matched,
                    missing = verification.missing,
                    kind_mismatch = verification.kind_mismatch,
                    rate = verification.match_rate(),
                    "Verification below threshold"
                );
            }
            results.push(verification);
        }

        Ok(VerifyReport {
            targets: results,
            duration: start.elapsed(),
        })
    }

    /// SCAN the source until the sample is full or the cursor wraps.
    async fn sample_keys(
        &self,
        conn: &mut redis::aio::ConnectionManager,
        deadline: Duration,
        filter: &KeyFilter,
    ) -> Result<Vec<String>> {
        let mut keys = Vec::with_capacity(self.sample_size);
        let mut cursor: u64 = 0;

        loop {
            let mut cmd = redis::cmd("SCAN");
            cmd.arg(cursor);
            if let Some(pattern) = &self.match_hint {
                cmd.arg("MATCH").arg(pattern);
            }
            cmd.arg("COUNT").arg(PROBE_CHUNK);

            let scanned: (u64, Vec<Vec<u8>>) = match timeout(deadline, cmd.query_async(conn)).await {
                Ok(Ok(reply)) => reply,
                Ok(Err(e)) => return Err(SyncError::redis("SCAN", e)),
                Err(_) => return Err(SyncError::redis_msg("SCAN", "deadline exceeded")),
            };
            let (next, batch) = scanned;

            for raw in batch {
                let key = String::from_utf8_lossy(&raw).into_owned();
                if filter.accept_key(&key) {
                    keys.push(key);
                    if keys.len() >= self.sample_size {
                        return Ok(keys);
                    }
                }
            }

            if next == 0 {
                return Ok(keys);
            }
            cursor = next;
        }
    }

    /// Pipelined EXISTS + TYPE probe of the sample on one target.
    async fn compare_target(
        &self,
        name: &str,
        conn: &mut redis::aio::ConnectionManager,
        deadline: Duration,
        keys: &[String],
        source_kinds: &[String],
    ) -> Result<TargetVerification> {
        let mut verification = TargetVerification {
            target: name.to_string(),
            sampled: keys.len(),
            matched: 0,
            missing: 0,
            kind_mismatch: 0,
        };

        for (key_chunk, kind_chunk) in keys.chunks(PROBE_CHUNK).zip(source_kinds.chunks(PROBE_CHUNK)) {
            let mut pipe = redis::pipe();
            for key in key_chunk {
                pipe.cmd("EXISTS").arg(key);
                pipe.cmd("TYPE").arg(key);
            }

            let probed = timeout(deadline, async {
                let replies: Vec<(i64, String)> = pipe.query_async(conn).await?;
                Ok::<_, redis::RedisError>(replies)
            })
            .await;

            let replies = match probed {
                Ok(Ok(replies)) => replies,
                Ok(Err(e)) => return Err(SyncError::redis("EXISTS/TYPE", e)),
                Err(_) => return Err(SyncError::redis_msg("EXISTS/TYPE", "deadline exceeded")),
            };

            for ((exists, target_kind), source_kind) in replies.iter().zip(kind_chunk) {
                if *exists == 0 {
                    verification.missing += 1;
                } else if target_kind == source_kind {
                    verification.matched += 1;
                } else {
                    verification.kind_mismatch += 1;
                }
            }
        }

        Ok(verification)
    }
}

/// Pipelined TYPE probe (the source side of the comparison).
async fn probe_kinds(
    conn: &mut redis::aio::ConnectionManager,
    keys: &[String],
    deadline: Duration,
    session: &str,
) -> Result<Vec<String>> {
    let mut kinds = Vec::with_capacity(keys.len());

    for chunk in keys.chunks(PROBE_CHUNK) {
        let mut pipe = redis::pipe();
        for key in chunk {
            pipe.cmd("TYPE").arg(key);
        }

        let probed = timeout(deadline, async {
            let replies: Vec<String> = pipe.query_async(conn).await?;
            Ok::<_, redis::RedisError>(replies)
        })
        .await;

        match probed {
            Ok(Ok(replies)) => kinds.extend(replies),
            Ok(Err(e)) => return Err(SyncError::redis("TYPE", e)),
            Err(_) => {
                return Err(SyncError::redis_msg(
                    "TYPE",
                    format!("deadline exceeded probing {}", session),
                ))
            }
        }
    }

    Ok(kinds)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verification(sampled: usize, matched: usize, missing: usize, kind_mismatch: usize) -> TargetVerification {
        TargetVerification {
            target: "t1".to_string(),
            sampled,
            matched,
            missing,
            kind_mismatch,
        }
    }

    #[test]
    fn test_match_rate_full() {
        let v = verification(100, 100, 0, 0);
        assert_eq!(v.match_rate(), 1.0);
        assert!(v.passed());
    }

    #[test]
    fn test_match_rate_at_threshold() {
        let v = verification(100, 95, 5, 0);
        assert_eq!(v.match_rate(), 0.95);
        assert!(v.passed());
    }

    #[test]
    fn test_match_rate_below_threshold() {
        let v = verification(100, 94, 4, 2);
        assert!(v.match_rate() < MATCH_THRESHOLD);
        assert!(!v.passed());
    }

    #[test]
    fn test_empty_sample_passes() {
        // Nothing on the source to disagree about.
        let v = verification(0, 0, 0, 0);
        assert_eq!(v.match_rate(), 1.0);
        assert!(v.passed());
    }

    #[test]
    fn test_kind_mismatch_counts_against() {
        let v = verification(10, 9, 0, 1);
        assert_eq!(v.match_rate(), 0.9);
        assert!(!v.passed());
    }

    #[test]
    fn test_report_all_passed() {
        let report = VerifyReport {
            targets: vec![verification(10, 10, 0, 0), verification(10, 10, 0, 0)],
            duration: Duration::from_millis(5),
        };
        assert!(report.all_passed());
        assert_eq!(report.failed_targets().count(), 0);
    }

    #[test]
    fn test_report_failed_targets() {
        let good = verification(10, 10, 0, 0);
        let mut bad = verification(10, 5, 5, 0);
        bad.target = "t2".to_string();

        let report = VerifyReport {
            targets: vec![good, bad],
            duration: Duration::from_millis(5),
        };
        assert!(!report.all_passed());
        let failed: Vec<_> = report.failed_targets().map(|t| t.target.as_str()).collect();
        assert_eq!(failed, vec!["t2"]);
    }

    #[test]
    fn test_verifier_clamps_sample_size() {
        let verifier = SyncVerifier::new(0, None);
        assert_eq!(verifier.sample_size, 1);
        let verifier = SyncVerifier::new(500, Some("user:*".to_string()));
        assert_eq!(verifier.sample_size, 500);
        assert_eq!(verifier.match_hint.as_deref(), Some("user:*"));
    }
}
