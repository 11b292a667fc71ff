//! Key filter: a pure predicate over key name, TTL, and size.
//!
//! Derived once from [`FilterConfig`](crate::config::FilterConfig) and
//! applied on every dispatch path. Exclusion wins over inclusion; an empty
//! include set accepts everything not excluded.

use glob::Pattern;

use crate::config::FilterConfig;
use crate::error::{Result, SyncError};

/// What the filter gets to look at. Cheap to build from probe pipelines;
/// no value payload required.
#[derive(Debug, Clone)]
pub struct KeyProbe<'a> {
    pub key: &'a str,
    /// Remaining TTL in ms; 0 = persistent, negative = missing.
    pub ttl_ms: i64,
    /// Serialized-size estimate in bytes.
    pub size_bytes: u64,
}

/// Compiled filter. Pure; owns no connections.
#[derive(Debug)]
pub struct KeyFilter {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
    min_ttl_ms: i64,
    max_value_bytes: u64,
}

impl KeyFilter {
    /// Compile the configured globs. Invalid patterns are a configuration
    /// error.
    pub fn new(config: &FilterConfig) -> Result<Self> {
        let compile = |patterns: &[String]| -> Result<Vec<Pattern>> {
            patterns
                .iter()
                .map(|p| {
                    Pattern::new(p)
                        .map_err(|e| SyncError::Config(format!("bad filter pattern '{}': {}", p, e)))
                })
                .collect()
        };

        Ok(Self {
            include: compile(&config.include_patterns)?,
            exclude: compile(&config.exclude_patterns)?,
            min_ttl_ms: (config.min_ttl_secs as i64).saturating_mul(1000),
            max_value_bytes: config.max_value_bytes,
        })
    }

    /// Accept-all filter.
    pub fn accept_all() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
            min_ttl_ms: 0,
            max_value_bytes: 0,
        }
    }

    /// Decide whether a key participates in replication.
    pub fn accept(&self, probe: &KeyProbe<'_>) -> bool {
        // Exclusion wins over inclusion.
        if self.exclude.iter().any(|p| p.matches(probe.key)) {
            return false;
        }

        if !self.include.is_empty() && !self.include.iter().any(|p| p.matches(probe.key)) {
            return false;
        }

        // TTL floor only applies to keys that actually expire.
        if self.min_ttl_ms > 0 && probe.ttl_ms > 0 && probe.ttl_ms < self.min_ttl_ms {
            return false;
        }

        if self.max_value_bytes > 0 && probe.size_bytes > self.max_value_bytes {
            return false;
        }

        true
    }

    /// Name-only acceptance, for paths where TTL and size are not yet
    /// known (e.g. tombstones).
    pub fn accept_key(&self, key: &str) -> bool {
        self.accept(&KeyProbe {
            key,
            ttl_ms: 0,
            size_bytes: 0,
        })
    }
}
