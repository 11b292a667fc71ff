//! Metrics for observability.
//!
//! Exports Prometheus-compatible signals for session health, driver
//! progress, fan-out results, dedup efficiency, and failover transitions.
//!
//! All metrics are prefixed with `mirror_` and follow the usual
//! conventions: counters end in `_total`, gauges represent current state,
//! histograms record seconds.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a session state transition (healthy/reconnecting/broken).
pub fn record_session_state(session: &str, state: &str) {
    gauge!("mirror_session_state", "session" => session.to_string(), "state" => state.to_string())
        .set(1.0);
    counter!("mirror_session_transitions_total", "session" => session.to_string(), "state" => state.to_string())
        .increment(1);
}

/// Record a health-tick ping result and latency.
pub fn record_session_ping(session: &str, success: bool, latency: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("mirror_session_pings_total", "session" => session.to_string(), "status" => status)
        .increment(1);
    histogram!("mirror_session_ping_latency_seconds", "session" => session.to_string())
        .record(latency.as_secs_f64());
}

/// Record change events emitted by a driver.
pub fn record_events_emitted(driver: &str, count: usize) {
    counter!("mirror_events_emitted_total", "driver" => driver.to_string())
        .increment(count as u64);
}

/// Record events suppressed by the dedup cache.
pub fn record_events_deduped(count: usize) {
    counter!("mirror_events_deduped_total").increment(count as u64);
}

/// Record a successful apply on one target.
pub fn record_event_applied(target: &str) {
    counter!("mirror_events_applied_total", "target" => target.to_string()).increment(1);
}

/// Record a failed apply on one target.
pub fn record_event_failed(target: &str, reason: &str) {
    counter!("mirror_events_failed_total", "target" => target.to_string(), "reason" => reason.to_string())
        .increment(1);
}

/// Record a per-target apply latency.
pub fn record_apply_latency(target: &str, latency: Duration) {
    histogram!("mirror_apply_duration_seconds", "target" => target.to_string())
        .record(latency.as_secs_f64());
}

/// Record a target health transition (active/cooling/disabled).
pub fn record_target_state(target: &str, state: &str) {
    counter!("mirror_target_transitions_total", "target" => target.to_string(), "state" => state.to_string())
        .increment(1);
}

/// Record the active incremental driver state.
pub fn record_driver_state(driver: &str, state: &str) {
    gauge!("mirror_driver_state", "driver" => driver.to_string(), "state" => state.to_string())
        .set(1.0);
}

/// Record a completed full-sync pass.
pub fn record_full_sync(strategy: &str, keys: usize, duration: Duration) {
    counter!("mirror_full_syncs_total", "strategy" => strategy.to_string()).increment(1);
    counter!("mirror_full_sync_keys_total", "strategy" => strategy.to_string())
        .increment(keys as u64);
    histogram!("mirror_full_sync_duration_seconds", "strategy" => strategy.to_string())
        .record(duration.as_secs_f64());
}

/// Record a post-sync verification result for one target.
pub fn record_verification(target: &str, sampled: usize, matched: usize, passed: bool) {
    let outcome = if passed { "passed" } else { "failed" };
    counter!("mirror_verifications_total", "target" => target.to_string(), "outcome" => outcome)
        .increment(1);
    counter!("mirror_verification_sampled_total", "target" => target.to_string())
        .increment(sampled as u64);
    counter!("mirror_verification_matched_total", "target" => target.to_string())
        .increment(matched as u64);
}

/// Record a scan-driver tick.
pub fn record_scan_tick(changed: usize, deleted: usize, duration: Duration) {
    counter!("mirror_scan_ticks_total").increment(1);
    counter!("mirror_scan_changed_keys_total").increment(changed as u64);
    counter!("mirror_scan_deleted_keys_total").increment(deleted as u64);
    histogram!("mirror_scan_tick_duration_seconds").record(duration.as_secs_f64());
}

/// Record the current replication offset (PSYNC driver).
pub fn record_replication_offset(offset: u64) {
    gauge!("mirror_replication_offset").set(offset as f64);
}

/// Record an outbound REPLCONF ACK.
pub fn record_ack_sent() {
    counter!("mirror_acks_sent_total").increment(1);
}

/// Record a replication command translated (or skipped).
pub fn record_stream_command(command: &str, translated: bool) {
    let outcome = if translated { "translated" } else { "skipped" };
    counter!("mirror_stream_commands_total", "command" => command.to_string(), "outcome" => outcome)
        .increment(1);
}

/// Record a full per-target pipeline queue (event recorded as failure).
pub fn record_queue_full(target: &str) {
    counter!("mirror_queue_full_total", "target" => target.to_string()).increment(1);
}

/// Record time the driver spent paused on the memory gauge.
pub fn record_backpressure_wait(duration: Duration) {
    counter!("mirror_backpressure_pauses_total").increment(1);
    histogram!("mirror_backpressure_wait_seconds").record(duration.as_secs_f64());
}

/// Gauge for bytes currently held by in-flight events.
pub fn set_inflight_bytes(bytes: usize) {
    gauge!("mirror_inflight_bytes").set(bytes as f64);
}

/// Gauge for engine lifecycle state.
pub fn set_engine_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Connecting" => 1.0,
        "FullSync" => 2.0,
        "Running" => 3.0,
        "ShuttingDown" => 4.0,
        "Stopped" => 5.0,
        "Failed" => 6.0,
        _ => -1.0,
    };
    gauge!("mirror_engine_state").set(value);
}
