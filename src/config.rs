//! Configuration for the mirror engine.
//!
//! This module defines the validated configuration record handed to
//! [`MirrorEngine::new()`](crate::MirrorEngine::new) by the external YAML
//! loader. The engine itself never touches files; everything here is plain
//! `serde` data that can be constructed programmatically or deserialized
//! from any format.
//!
//! # Configuration Structure
//!
//! ```text
//! SyncConfig
//! ├── source: EndpointConfig        # The Redis instance we mirror from
//! ├── targets: Vec<TargetConfig>    # Named instances we mirror into
//! ├── sync: SyncSettings
//! │   ├── mode: full | incremental | hybrid
//! │   ├── full_sync: FullSyncConfig     # scan | sync | dump_restore
//! │   └── incremental_sync: IncrementalConfig  # scan | sync | psync driver
//! ├── filters: FilterConfig         # include/exclude globs, ttl/size bounds
//! └── service: ServiceConfig
//!     ├── retry: RetrySettings
//!     ├── failover: FailoverConfig
//!     └── performance: PerformanceConfig
//! ```
//!
//! # YAML Example (parsed by the external loader)
//!
//! ```yaml
//! source:
//!   host: "redis-primary.internal"
//!   port: 6379
//!   socket_timeout_secs: 60
//!   socket_keepalive: true
//!
//! targets:
//!   - name: "eu-backup"
//!     host: "redis-eu.example.com"
//!     port: 6379
//!   - name: "apac-backup"
//!     host: "redis-apac.example.com"
//!     port: 6380
//!     enabled: false
//!
//! sync:
//!   mode: hybrid
//!   full_sync:
//!     strategy: scan
//!     batch_size: 1000
//!   incremental_sync:
//!     driver: psync
//!     interval_secs: 30
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::error::{Result, SyncError};

// ═══════════════════════════════════════════════════════════════════════════════
// Endpoints
// ═══════════════════════════════════════════════════════════════════════════════

/// Connection parameters for one Redis instance.
///
/// The source endpoint carries no name; target identity lives in
/// [`TargetConfig::name`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Logical database index selected after connect.
    #[serde(default)]
    pub db: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Enable TLS (`rediss://`).
    #[serde(default)]
    pub tls: bool,

    /// Socket read timeout applied to every request, so a silently dead
    /// link surfaces within bounded time.
    #[serde(default = "default_socket_timeout_secs")]
    pub socket_timeout_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub socket_connect_timeout_secs: u64,

    /// TCP keepalive on the session sockets.
    #[serde(default = "default_true")]
    pub socket_keepalive: bool,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    6379
}

fn default_socket_timeout_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    30
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db: 0,
            password: None,
            tls: false,
            socket_timeout_secs: 60,
            socket_connect_timeout_secs: 30,
            socket_keepalive: true,
        }
    }
}

impl EndpointConfig {
    /// Build the connection URL for the `redis` client.
    ///
    /// Credentials and the database index ride in the URL so AUTH/SELECT
    /// happen inside the client's connect path.
    pub fn redis_url(&self) -> String {
        let scheme = if self.tls { "rediss" } else { "redis" };
        match &self.password {
            Some(pw) => format!("{}://:{}@{}:{}/{}", scheme, pw, self.host, self.port, self.db),
            None => format!("{}://{}:{}/{}", scheme, self.host, self.port, self.db),
        }
    }

    /// Human-readable address for logs (never includes the password).
    pub fn address(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.db)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_connect_timeout_secs)
    }

    /// Endpoint for testing against a local instance.
    pub fn for_testing(port: u16) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port,
            ..Default::default()
        }
    }
}

/// One mirror target: a stable name plus endpoint parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Stable identity used in logs, metrics, and the status surface.
    pub name: String,

    #[serde(flatten)]
    pub endpoint: EndpointConfig,

    /// Disabled targets are skipped entirely by the dispatcher.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl TargetConfig {
    /// Create a target config for testing.
    pub fn for_testing(name: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            endpoint: EndpointConfig::for_testing(port),
            enabled: true,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Sync settings
// ═══════════════════════════════════════════════════════════════════════════════

/// Overall replication mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// One-shot full materialization, then stop.
    Full,
    /// Incremental propagation only; assumes targets were seeded elsewhere.
    Incremental,
    /// Full sync first, incremental after the completion marker.
    Hybrid,
}

/// Strategy for the initial materialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FullSyncStrategy {
    /// SCAN cursor walk with per-kind reads.
    Scan,
    /// SYNC replication command; RDB payload parsed into key records.
    Sync,
    /// SCAN walk using DUMP/RESTORE payloads, skipping per-kind handlers.
    DumpRestore,
}

/// Which incremental driver produces change events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Periodic SCAN + OBJECT IDLETIME polling. Portable everywhere.
    Scan,
    /// Periodic full resynchronization. Simple, bandwidth-heavy.
    Sync,
    /// Replication-protocol consumer with ACK heartbeats. Real-time.
    Psync,
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverKind::Scan => write!(f, "scan"),
            DriverKind::Sync => write!(f, "sync"),
            DriverKind::Psync => write!(f, "psync"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default = "default_mode")]
    pub mode: SyncMode,

    #[serde(default)]
    pub full_sync: FullSyncConfig,

    #[serde(default)]
    pub incremental_sync: IncrementalConfig,
}

fn default_mode() -> SyncMode {
    SyncMode::Hybrid
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            mode: SyncMode::Hybrid,
            full_sync: FullSyncConfig::default(),
            incremental_sync: IncrementalConfig::default(),
        }
    }
}

/// Full-sync phase settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullSyncConfig {
    #[serde(default = "default_strategy")]
    pub strategy: FullSyncStrategy,

    /// SCAN COUNT hint and pipeline batch size.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Carry source TTLs onto targets; persistent keys stay persistent.
    #[serde(default = "default_true")]
    pub preserve_ttl: bool,

    /// Sample-compare source and targets after materialization.
    #[serde(default = "default_true")]
    pub verify_migration: bool,

    /// How many keys the verification pass samples per target.
    #[serde(default = "default_verify_sample_size")]
    pub verify_sample_size: usize,
}

fn default_strategy() -> FullSyncStrategy {
    FullSyncStrategy::Scan
}

fn default_batch_size() -> usize {
    1000
}

fn default_verify_sample_size() -> usize {
    100
}

impl Default for FullSyncConfig {
    fn default() -> Self {
        Self {
            strategy: FullSyncStrategy::Scan,
            batch_size: 1000,
            preserve_ttl: true,
            verify_migration: true,
            verify_sample_size: 100,
        }
    }
}

/// Incremental phase settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrementalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_driver")]
    pub driver: DriverKind,

    /// Scan/Sync driver tick interval. Tunable down to 1s.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Upper bound on change events emitted per tick.
    #[serde(default = "default_max_changes")]
    pub max_changes_per_sync: usize,

    /// Port announced in `REPLCONF listening-port` (PSYNC driver).
    #[serde(default = "default_listening_port")]
    pub listening_port: u16,

    /// REPLCONF ACK cadence as a duration string (e.g. "1s").
    #[serde(default = "default_ack_interval")]
    pub ack_interval: String,

    /// Optional event-rate ceiling, to keep a reconnect burst from
    /// flattening the targets.
    #[serde(default)]
    pub rate_limit_per_sec: Option<u32>,
}

fn default_driver() -> DriverKind {
    DriverKind::Scan
}

fn default_interval_secs() -> u64 {
    30
}

fn default_max_changes() -> usize {
    10_000
}

fn default_listening_port() -> u16 {
    6380
}

fn default_ack_interval() -> String {
    "1s".to_string()
}

impl Default for IncrementalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            driver: DriverKind::Scan,
            interval_secs: 30,
            max_changes_per_sync: 10_000,
            listening_port: 6380,
            ack_interval: "1s".to_string(),
            rate_limit_per_sec: None,
        }
    }
}

impl IncrementalConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Parse the ack_interval string to a Duration.
    pub fn ack_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.ack_interval).unwrap_or(Duration::from_secs(1))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Filters
// ═══════════════════════════════════════════════════════════════════════════════

/// Key selection rules, applied before any write reaches a target.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Glob patterns; empty means "accept all not excluded".
    #[serde(default)]
    pub include_patterns: Vec<String>,

    /// Glob patterns; exclusion wins over inclusion.
    #[serde(default)]
    pub exclude_patterns: Vec<String>,

    /// Reject keys expiring sooner than this many seconds. 0 = no floor.
    /// Persistent keys always pass.
    #[serde(default)]
    pub min_ttl_secs: u64,

    /// Reject values larger than this many bytes. 0 = no ceiling.
    #[serde(default)]
    pub max_value_bytes: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Service settings
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub failover: FailoverConfig,
    #[serde(default)]
    pub performance: PerformanceConfig,
}

/// Reconnect backoff for target sessions. The source retries without bound
/// regardless of `max_attempts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,

    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

fn default_max_attempts() -> usize {
    5
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_initial_delay_secs() -> u64 {
    1
}

fn default_max_delay_secs() -> u64 {
    60
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_factor: 2.0,
            initial_delay_secs: 1,
            max_delay_secs: 60,
        }
    }
}

/// Per-target failure counting and cooldown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Consecutive failures before a target enters Cooling.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    /// Seconds a Cooling target is skipped before re-enable.
    #[serde(default = "default_recovery_delay_secs")]
    pub recovery_delay_secs: u64,
}

fn default_max_failures() -> u32 {
    10
}

fn default_recovery_delay_secs() -> u64 {
    120
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_failures: 10,
            recovery_delay_secs: 120,
        }
    }
}

impl FailoverConfig {
    pub fn recovery_delay(&self) -> Duration {
        Duration::from_secs(self.recovery_delay_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Worker-pool cap for per-event target application.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// In-flight event payload ceiling in bytes; exceeding it pauses the
    /// incremental driver until the dispatcher drains. 0 = unbounded.
    #[serde(default = "default_memory_limit")]
    pub memory_limit_bytes: u64,
}

fn default_max_workers() -> usize {
    8
}

fn default_memory_limit() -> u64 {
    256 * 1024 * 1024
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_workers: 8,
            memory_limit_bytes: 256 * 1024 * 1024,
        }
    }
}

fn default_true() -> bool {
    true
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `MirrorEngine::new()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub source: EndpointConfig,

    #[serde(default)]
    pub targets: Vec<TargetConfig>,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub filters: FilterConfig,

    #[serde(default)]
    pub service: ServiceConfig,
}

impl SyncConfig {
    /// Create a minimal config for testing with the given targets.
    pub fn for_testing(targets: Vec<TargetConfig>) -> Self {
        Self {
            source: EndpointConfig::for_testing(6379),
            targets,
            ..Default::default()
        }
    }

    /// Reject configurations the engine cannot run with.
    ///
    /// Rejection is fatal at start (exit code 2).
    pub fn validate(&self) -> Result<()> {
        if self.targets.is_empty() {
            return Err(SyncError::Config("no targets configured".to_string()));
        }

        let mut names = HashSet::new();
        for target in &self.targets {
            if target.name.is_empty() {
                return Err(SyncError::Config("target with empty name".to_string()));
            }
            if !names.insert(target.name.as_str()) {
                return Err(SyncError::Config(format!(
                    "duplicate target name: {}",
                    target.name
                )));
            }
        }

        if !self.targets.iter().any(|t| t.enabled) {
            return Err(SyncError::Config("all targets are disabled".to_string()));
        }

        let inc = &self.sync.incremental_sync;
        if inc.enabled && inc.interval_secs == 0 {
            return Err(SyncError::Config(
                "incremental interval must be at least 1 second".to_string(),
            ));
        }

        let full = &self.sync.full_sync;
        if full.verify_migration && full.verify_sample_size == 0 {
            return Err(SyncError::Config(
                "verify_sample_size must be positive when verification is enabled".to_string(),
            ));
        }

        if self.service.performance.max_workers == 0 {
            return Err(SyncError::Config("max_workers must be positive".to_string()));
        }

        for pattern in self
            .filters
            .include_patterns
            .iter()
            .chain(self.filters.exclude_patterns.iter())
        {
            glob::Pattern::new(pattern)
                .map_err(|e| SyncError::Config(format!("bad filter pattern '{}': {}", pattern, e)))?;
        }

        Ok(())
    }

    /// Targets that participate in dispatch.
    pub fn enabled_targets(&self) -> impl Iterator<Item = &TargetConfig> {
        self.targets.iter().filter(|t| t.enabled)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn two_target_config() -> SyncConfig {
        SyncConfig::for_testing(vec![
            TargetConfig::for_testing("t1", 6380),
            TargetConfig::for_testing("t2", 6381),
        ])
    }

    #[test]
    fn test_redis_url_plain() {
        let ep = EndpointConfig::for_testing(6379);
        assert_eq!(ep.redis_url(), "redis://127.0.0.1:6379/0");
    }

    #[test]
    fn test_redis_url_with_password_and_db() {
        let ep = EndpointConfig {
            host: "example.com".to_string(),
            port: 6400,
            db: 3,
            password: Some("s3cret".to_string()),
            ..Default::default()
        };
        assert_eq!(ep.redis_url(), "redis://:s3cret@example.com:6400/3");
    }

    #[test]
    fn test_redis_url_tls() {
        let ep = EndpointConfig {
            tls: true,
            ..EndpointConfig::for_testing(6379)
        };
        assert!(ep.redis_url().starts_with("rediss://"));
    }

    #[test]
    fn test_address_hides_password() {
        let ep = EndpointConfig {
            password: Some("s3cret".to_string()),
            ..EndpointConfig::for_testing(6379)
        };
        assert!(!ep.address().contains("s3cret"));
    }

    #[test]
    fn test_endpoint_defaults() {
        let ep = EndpointConfig::default();
        assert_eq!(ep.host, "localhost");
        assert_eq!(ep.port, 6379);
        assert_eq!(ep.db, 0);
        assert!(ep.socket_keepalive);
        assert_eq!(ep.socket_timeout(), Duration::from_secs(60));
        assert_eq!(ep.connect_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_validate_ok() {
        assert!(two_target_config().validate().is_ok());
    }

    #[test]
    fn test_validate_no_targets() {
        let config = SyncConfig::default();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_validate_duplicate_names() {
        let config = SyncConfig::for_testing(vec![
            TargetConfig::for_testing("t1", 6380),
            TargetConfig::for_testing("t1", 6381),
        ]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_all_disabled() {
        let mut config = two_target_config();
        for t in &mut config.targets {
            t.enabled = false;
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_interval() {
        let mut config = two_target_config();
        config.sync.incremental_sync.interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_verify_sample() {
        let mut config = two_target_config();
        config.sync.full_sync.verify_sample_size = 0;
        assert!(config.validate().is_err());

        // Disabled verification tolerates a zero sample size.
        config.sync.full_sync.verify_migration = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_bad_pattern() {
        let mut config = two_target_config();
        config.filters.include_patterns.push("user:[".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_enabled_targets() {
        let mut config = two_target_config();
        config.targets[1].enabled = false;
        let enabled: Vec<_> = config.enabled_targets().map(|t| t.name.as_str()).collect();
        assert_eq!(enabled, vec!["t1"]);
    }

    #[test]
    fn test_sync_defaults() {
        let settings = SyncSettings::default();
        assert_eq!(settings.mode, SyncMode::Hybrid);
        assert_eq!(settings.full_sync.strategy, FullSyncStrategy::Scan);
        assert_eq!(settings.full_sync.batch_size, 1000);
        assert!(settings.full_sync.preserve_ttl);
        assert!(settings.full_sync.verify_migration);
        assert_eq!(settings.full_sync.verify_sample_size, 100);
        assert_eq!(settings.incremental_sync.driver, DriverKind::Scan);
        assert_eq!(settings.incremental_sync.interval_secs, 30);
        assert_eq!(settings.incremental_sync.max_changes_per_sync, 10_000);
    }

    #[test]
    fn test_ack_interval_parsing() {
        let mut inc = IncrementalConfig::default();
        assert_eq!(inc.ack_interval_duration(), Duration::from_secs(1));

        inc.ack_interval = "500ms".to_string();
        assert_eq!(inc.ack_interval_duration(), Duration::from_millis(500));

        // Invalid string falls back to 1s
        inc.ack_interval = "whenever".to_string();
        assert_eq!(inc.ack_interval_duration(), Duration::from_secs(1));
    }

    #[test]
    fn test_failover_defaults() {
        let f = FailoverConfig::default();
        assert!(f.enabled);
        assert_eq!(f.max_failures, 10);
        assert_eq!(f.recovery_delay(), Duration::from_secs(120));
    }

    #[test]
    fn test_retry_defaults() {
        let r = RetrySettings::default();
        assert_eq!(r.max_attempts, 5);
        assert_eq!(r.backoff_factor, 2.0);
        assert_eq!(r.initial_delay_secs, 1);
        assert_eq!(r.max_delay_secs, 60);
    }

    #[test]
    fn test_performance_defaults() {
        let p = PerformanceConfig::default();
        assert_eq!(p.max_workers, 8);
        assert_eq!(p.memory_limit_bytes, 256 * 1024 * 1024);
    }

    #[test]
    fn test_mode_serde_names() {
        assert_eq!(serde_json::to_string(&SyncMode::Hybrid).unwrap(), "\"hybrid\"");
        assert_eq!(
            serde_json::to_string(&FullSyncStrategy::DumpRestore).unwrap(),
            "\"dump_restore\""
        );
        assert_eq!(serde_json::to_string(&DriverKind::Psync).unwrap(), "\"psync\"");
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = two_target_config();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: SyncConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.targets.len(), 2);
        assert_eq!(parsed.targets[0].name, "t1");
        assert_eq!(parsed.targets[1].endpoint.port, 6381);
        assert_eq!(parsed.sync.mode, SyncMode::Hybrid);
    }

    #[test]
    fn test_config_minimal_json() {
        // A loader may hand us a sparse document; defaults must fill in.
        let json = r#"{
            "source": {"host": "src"},
            "targets": [{"name": "t1", "host": "dst", "port": 7000}]
        }"#;
        let parsed: SyncConfig = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.source.host, "src");
        assert_eq!(parsed.source.port, 6379);
        assert_eq!(parsed.targets[0].endpoint.port, 7000);
        assert!(parsed.targets[0].enabled);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_driver_kind_display() {
        assert_eq!(DriverKind::Scan.to_string(), "scan");
        assert_eq!(DriverKind::Sync.to_string(), "sync");
        assert_eq!(DriverKind::Psync.to_string(), "psync");
    }
}
