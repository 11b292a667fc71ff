// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-flight data model: key records, change events, fingerprints.
//!
//! A [`KeyRecord`] is a transient copy of one key read from the source:
//! name, data kind, kind-specific payload, and remaining TTL. Records are
//! created by the full-sync engine or an incremental driver and dropped
//! once dispatch to every target has terminated.
//!
//! A [`ChangeEvent`] wraps one operation (write, tombstone, or global
//! flush) with an origin timestamp and a 128-bit fingerprint over
//! (key ∥ kind ∥ value bytes). Two events with equal fingerprints inside
//! the dedup window are considered equivalent and the second is dropped.

use sha2::{Digest, Sha256};

/// The six Redis data kinds this engine replicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    String,
    Hash,
    List,
    Set,
    SortedSet,
    Stream,
}

impl KeyKind {
    /// Map a `TYPE` reply to a kind. Unknown types are not replicated.
    pub fn from_type_name(name: &str) -> Option<Self> {
        match name {
            "string" => Some(KeyKind::String),
            "hash" => Some(KeyKind::Hash),
            "list" => Some(KeyKind::List),
            "set" => Some(KeyKind::Set),
            "zset" => Some(KeyKind::SortedSet),
            "stream" => Some(KeyKind::Stream),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            KeyKind::String => "string",
            KeyKind::Hash => "hash",
            KeyKind::List => "list",
            KeyKind::Set => "set",
            KeyKind::SortedSet => "zset",
            KeyKind::Stream => "stream",
        }
    }
}

/// Kind-specific payload.
///
/// `Dump` is the opaque seventh variant for the DUMP/RESTORE path; it
/// short-circuits the kind switch in the codec.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyValue {
    Str(Vec<u8>),
    /// Field/value pairs.
    Hash(Vec<(Vec<u8>, Vec<u8>)>),
    /// Elements head to tail.
    List(Vec<Vec<u8>>),
    Set(Vec<Vec<u8>>),
    /// (member, score), ascending by score.
    SortedSet(Vec<(Vec<u8>, f64)>),
    /// (entry id, field/value pairs), ascending by id.
    Stream(Vec<(String, Vec<(Vec<u8>, Vec<u8>)>)>),
    /// Opaque DUMP payload; replayed via RESTORE.
    Dump(Vec<u8>),
}

impl KeyValue {
    /// Canonical byte serialization used for fingerprints and size
    /// estimates. Not a wire format.
    pub fn digest_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            KeyValue::Str(v) => out.extend_from_slice(v),
            KeyValue::Hash(pairs) => {
                for (f, v) in pairs {
                    out.extend_from_slice(f);
                    out.push(0);
                    out.extend_from_slice(v);
                    out.push(0);
                }
            }
            KeyValue::List(items) | KeyValue::Set(items) => {
                for item in items {
                    out.extend_from_slice(item);
                    out.push(0);
                }
            }
            KeyValue::SortedSet(members) => {
                for (m, score) in members {
                    out.extend_from_slice(m);
                    out.push(0);
                    out.extend_from_slice(&score.to_le_bytes());
                }
            }
            KeyValue::Stream(entries) => {
                for (id, fields) in entries {
                    out.extend_from_slice(id.as_bytes());
                    out.push(0);
                    for (f, v) in fields {
                        out.extend_from_slice(f);
                        out.push(0);
                        out.extend_from_slice(v);
                        out.push(0);
                    }
                }
            }
            KeyValue::Dump(payload) => out.extend_from_slice(payload),
        }
        out
    }

    /// Approximate payload size in bytes, for the filter and memory gauge.
    pub fn size_estimate(&self) -> usize {
        match self {
            KeyValue::Str(v) => v.len(),
            KeyValue::Hash(pairs) => pairs.iter().map(|(f, v)| f.len() + v.len()).sum(),
            KeyValue::List(items) | KeyValue::Set(items) => items.iter().map(|i| i.len()).sum(),
            KeyValue::SortedSet(members) => members.iter().map(|(m, _)| m.len() + 8).sum(),
            KeyValue::Stream(entries) => entries
                .iter()
                .map(|(id, fields)| {
                    id.len() + fields.iter().map(|(f, v)| f.len() + v.len()).sum::<usize>()
                })
                .sum(),
            KeyValue::Dump(payload) => payload.len(),
        }
    }
}

/// Transient copy of one key, read from the source.
///
/// `ttl_ms` semantics: 0 = no expiry, > 0 = remaining milliseconds,
/// negative = tombstone (the key was gone by the time we read it).
#[derive(Debug, Clone, PartialEq)]
pub struct KeyRecord {
    pub key: String,
    pub kind: KeyKind,
    pub value: KeyValue,
    pub ttl_ms: i64,
}

impl KeyRecord {
    pub fn is_tombstone(&self) -> bool {
        self.ttl_ms < 0
    }
}

/// One replicable operation.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeOp {
    /// Write (or overwrite) a key at its scan-time value.
    Write(KeyRecord),
    /// Key deleted or expired on the source.
    Delete(String),
    /// FLUSHDB/FLUSHALL observed on the source; global tombstone.
    FlushAll,
}

impl ChangeOp {
    pub fn key(&self) -> Option<&str> {
        match self {
            ChangeOp::Write(record) => Some(&record.key),
            ChangeOp::Delete(key) => Some(key),
            ChangeOp::FlushAll => None,
        }
    }

    /// Payload bytes held in memory while the event is in flight.
    pub fn size_estimate(&self) -> usize {
        match self {
            ChangeOp::Write(record) => record.key.len() + record.value.size_estimate(),
            ChangeOp::Delete(key) => key.len(),
            ChangeOp::FlushAll => 0,
        }
    }
}

/// A change event flowing from a driver to the fan-out dispatcher.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub op: ChangeOp,
    /// Milliseconds since the epoch at which the change was observed.
    pub origin_ms: u64,
    /// 128-bit digest of (key ∥ kind ∥ value bytes).
    pub fingerprint: [u8; 16],
}

impl ChangeEvent {
    /// Build an event, computing its fingerprint.
    pub fn new(op: ChangeOp) -> Self {
        let fingerprint = fingerprint_op(&op);
        Self {
            op,
            origin_ms: epoch_millis(),
            fingerprint,
        }
    }

    pub fn write(record: KeyRecord) -> Self {
        Self::new(ChangeOp::Write(record))
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::new(ChangeOp::Delete(key.into()))
    }

    pub fn flush_all() -> Self {
        Self::new(ChangeOp::FlushAll)
    }
}

/// Fingerprint of an operation: first 128 bits of SHA-256 over
/// (key ∥ kind tag ∥ value bytes).
pub fn fingerprint_op(op: &ChangeOp) -> [u8; 16] {
    let mut hasher = Sha256::new();
    match op {
        ChangeOp::Write(record) => {
            hasher.update(record.key.as_bytes());
            hasher.update([0u8]);
            hasher.update(record.kind.type_name().as_bytes());
            hasher.update([0u8]);
            hasher.update(record.value.digest_bytes());
        }
        ChangeOp::Delete(key) => {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            hasher.update(b"del");
        }
        ChangeOp::FlushAll => {
            hasher.update(b"flushall");
        }
    }
    let digest = hasher.finalize();
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    out
}

/// Current epoch milliseconds.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
