// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the mirror engine.
//!
//! Errors are categorized by their source (Redis transport, replication
//! protocol, configuration, ...) and carry enough context to debug a
//! misbehaving link without packet captures.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Redis` | Yes | Network errors, timeouts, connection failures |
//! | `SourceConnection` | Yes | Source unreachable, connection dropped |
//! | `TargetConnection` | Yes | A target unreachable, connection dropped |
//! | `Unavailable` | No | Session is Broken; fail fast until next health tick |
//! | `Auth` | No | Endpoint rejected credentials |
//! | `Config` | No | Configuration invalid |
//! | `Protocol` | No | Replication handshake reply not understood |
//! | `RespParse` | No | Malformed inline command in the replication stream |
//! | `RdbParse` | No | Malformed RDB payload |
//! | `Downgrade` | No | PSYNC driver giving up; switch to the scan driver |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`SyncError::is_retryable()`] to decide whether an operation should
//! be retried with backoff. Retryable errors indicate transient network or
//! availability issues; everything else needs a config fix or a human.
//!
//! # Exit Codes
//!
//! The external CLI maps a terminal error to a process exit code via
//! [`SyncError::exit_code()`]: 0 clean shutdown, 2 configuration rejected,
//! 3 source unreachable at start, 4 irrecoverable replication error.

use thiserror::Error;

/// Result type alias for mirror operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur while mirroring.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Redis connection or command error.
    ///
    /// These are typically retryable (network timeouts, connection drops).
    #[error("Redis error ({operation}): {message}")]
    Redis {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// Source connection failure. Retryable with exponential backoff;
    /// the source supervisor retries without bound.
    #[error("Source connection error: {message}")]
    SourceConnection { message: String },

    /// Target connection failure. Retryable with bounded backoff.
    #[error("Target connection error ({name}): {message}")]
    TargetConnection { name: String, message: String },

    /// Session is in Broken state and will not be handed out.
    ///
    /// Not retryable by the caller; the supervisor's next health tick owns
    /// recovery.
    #[error("Session unavailable: {endpoint}")]
    Unavailable { endpoint: String },

    /// Endpoint rejected our credentials. Fatal for that endpoint; the
    /// target is marked Disabled rather than retried.
    #[error("Authentication failed for {endpoint}: {message}")]
    Auth { endpoint: String, message: String },

    /// Invalid or missing configuration. Fix the configuration and restart.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unexpected reply during the replication handshake or stream.
    #[error("Replication protocol error: {0}")]
    Protocol(String),

    /// Malformed inline command in the replication stream.
    #[error("RESP parse error: {0}")]
    RespParse(String),

    /// Malformed RDB payload from the source.
    #[error("RDB parse error: {0}")]
    RdbParse(String),

    /// The PSYNC driver failed three consecutive handshakes with replies it
    /// did not recognize; the coordinator should fall back to the scan
    /// driver.
    #[error("PSYNC unsupported by source, downgrade to scan driver")]
    Downgrade,

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error. Indicates a bug that needs investigation.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Create a Redis error from a redis::RedisError.
    pub fn redis(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a Redis error without source.
    pub fn redis_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Redis { .. } => true,
            Self::SourceConnection { .. } => true,
            Self::TargetConnection { .. } => true,
            Self::Unavailable { .. } => false,
            Self::Auth { .. } => false,
            Self::Config(_) => false,
            Self::Protocol(_) => false,
            Self::RespParse(_) => false,
            Self::RdbParse(_) => false,
            Self::Downgrade => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Map a terminal error to the process exit code surfaced by the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Shutdown => 0,
            Self::Config(_) => 2,
            Self::SourceConnection { .. } => 3,
            _ => 4,
        }
    }
}

impl From<redis::RedisError> for SyncError {
    fn from(e: redis::RedisError) -> Self {
        Self::redis("unknown", e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_redis() {
        let err = SyncError::redis_msg("SCAN", "connection reset");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("SCAN"));
    }

    #[test]
    fn test_is_retryable_connections() {
        let err = SyncError::SourceConnection {
            message: "connection refused".to_string(),
        };
        assert!(err.is_retryable());

        let err = SyncError::TargetConnection {
            name: "backup-1".to_string(),
            message: "connection refused".to_string(),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("backup-1"));
    }

    #[test]
    fn test_unavailable_fails_fast() {
        let err = SyncError::Unavailable {
            endpoint: "backup-1".to_string(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_retryable_config() {
        let err = SyncError::Config("no targets configured".to_string());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_retryable_auth() {
        let err = SyncError::Auth {
            endpoint: "backup-1".to_string(),
            message: "WRONGPASS".to_string(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_retryable_parse_errors() {
        assert!(!SyncError::RespParse("truncated array".to_string()).is_retryable());
        assert!(!SyncError::RdbParse("bad magic".to_string()).is_retryable());
        assert!(!SyncError::Protocol("-ERR unknown command".to_string()).is_retryable());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(SyncError::Shutdown.exit_code(), 0);
        assert_eq!(SyncError::Config("bad".to_string()).exit_code(), 2);
        assert_eq!(
            SyncError::SourceConnection {
                message: "unreachable".to_string()
            }
            .exit_code(),
            3
        );
        assert_eq!(SyncError::Downgrade.exit_code(), 4);
        assert_eq!(SyncError::Internal("bug".to_string()).exit_code(), 4);
    }

    #[test]
    fn test_redis_error_formatting() {
        let err = SyncError::Redis {
            operation: "PSYNC".to_string(),
            message: "timeout".to_string(),
            source: None,
        };
        let msg = err.to_string();
        assert!(msg.contains("Redis error"));
        assert!(msg.contains("PSYNC"));
        assert!(msg.contains("timeout"));
    }
}
