// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Value codec: reads a key from the source and applies it to a target,
//! preserving TTL. One read/write pair per data kind:
//!
//! | Kind      | Read                    | Write                          |
//! |-----------|-------------------------|--------------------------------|
//! | String    | GET + PTTL              | SET with PX                    |
//! | Hash      | HGETALL + PTTL          | DEL, HSET fields, PEXPIRE      |
//! | List      | LRANGE 0 -1 + PTTL      | DEL, RPUSH in order, PEXPIRE   |
//! | Set       | SMEMBERS + PTTL         | DEL, SADD, PEXPIRE             |
//! | SortedSet | ZRANGE WITHSCORES + PTTL| DEL, ZADD, PEXPIRE             |
//! | Stream    | XRANGE - +              | XADD entries preserving IDs    |
//!
//! The opaque alternative is DUMP on the source and RESTORE REPLACE on the
//! target. RESTORE requires compatible serialization versions; a version
//! mismatch is detectable via [`is_restore_version_mismatch`] and the
//! caller falls back to the kind-specific path for that key.
//!
//! TTL discipline: a positive source PTTL becomes PX/PEXPIRE on the
//! target, −1 (persistent) suppresses the expiry entirely, −2 (missing)
//! turns the operation into a DEL.

use redis::aio::ConnectionManager;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::record::{ChangeEvent, ChangeOp, KeyKind, KeyRecord, KeyValue};

/// Outcome of probing one key on the source.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    Record(KeyRecord),
    /// Key no longer exists (PTTL −2 / TYPE none); caller emits a tombstone.
    Missing,
    /// A type this engine does not replicate (modules etc.).
    Unsupported(String),
}

/// Per-kind read/write pairs. Stateless apart from the TTL policy.
#[derive(Debug, Clone, Copy)]
pub struct ValueCodec {
    preserve_ttl: bool,
}

impl ValueCodec {
    pub fn new(preserve_ttl: bool) -> Self {
        Self { preserve_ttl }
    }

    /// Read a key's kind, value, and remaining TTL from the source.
    pub async fn read_key(
        &self,
        conn: &mut ConnectionManager,
        key: &str,
        deadline: Duration,
    ) -> Result<ReadOutcome> {
        let type_name: String = run(deadline, "TYPE", async {
            redis::cmd("TYPE").arg(key).query_async(conn).await
        })
        .await?;

        if type_name == "none" {
            return Ok(ReadOutcome::Missing);
        }
        let Some(kind) = KeyKind::from_type_name(&type_name) else {
            return Ok(ReadOutcome::Unsupported(type_name));
        };

        let ttl_ms: i64 = run(deadline, "PTTL", async {
            redis::cmd("PTTL").arg(key).query_async(conn).await
        })
        .await?;
        if ttl_ms == -2 {
            return Ok(ReadOutcome::Missing);
        }
        // −1 (persistent) normalizes to "no expiry".
        let ttl_ms = ttl_ms.max(0);

        let value = match kind {
            KeyKind::String => {
                let data: Option<Vec<u8>> = run(deadline, "GET", async {
                    redis::cmd("GET").arg(key).query_async(conn).await
                })
                .await?;
                match data {
                    Some(bytes) => KeyValue::Str(bytes),
                    None => return Ok(ReadOutcome::Missing),
                }
            }
            KeyKind::Hash => {
                let pairs: Vec<(Vec<u8>, Vec<u8>)> = run(deadline, "HGETALL", async {
                    redis::cmd("HGETALL").arg(key).query_async(conn).await
                })
                .await?;
                KeyValue::Hash(pairs)
            }
            KeyKind::List => {
                let items: Vec<Vec<u8>> = run(deadline, "LRANGE", async {
                    redis::cmd("LRANGE").arg(key).arg(0).arg(-1).query_async(conn).await
                })
                .await?;
                KeyValue::List(items)
            }
            KeyKind::Set => {
                let items: Vec<Vec<u8>> = run(deadline, "SMEMBERS", async {
                    redis::cmd("SMEMBERS").arg(key).query_async(conn).await
                })
                .await?;
                KeyValue::Set(items)
            }
            KeyKind::SortedSet => {
                let members: Vec<(Vec<u8>, f64)> = run(deadline, "ZRANGE", async {
                    redis::cmd("ZRANGE")
                        .arg(key)
                        .arg(0)
                        .arg(-1)
                        .arg("WITHSCORES")
                        .query_async(conn)
                        .await
                })
                .await?;
                KeyValue::SortedSet(members)
            }
            KeyKind::Stream => {
                let entries: Vec<(String, Vec<(Vec<u8>, Vec<u8>)>)> =
                    run(deadline, "XRANGE", async {
                        redis::cmd("XRANGE").arg(key).arg("-").arg("+").query_async(conn).await
                    })
                    .await?;
                KeyValue::Stream(entries)
            }
        };

        Ok(ReadOutcome::Record(KeyRecord {
            key: key.to_string(),
            kind,
            value,
            ttl_ms,
        }))
    }

    /// DUMP a key into the opaque variant.
    pub async fn read_dump(
        &self,
        conn: &mut ConnectionManager,
        key: &str,
        deadline: Duration,
    ) -> Result<ReadOutcome> {
        let ttl_ms: i64 = run(deadline, "PTTL", async {
            redis::cmd("PTTL").arg(key).query_async(conn).await
        })
        .await?;
        if ttl_ms == -2 {
            return Ok(ReadOutcome::Missing);
        }

        let payload: Option<Vec<u8>> = run(deadline, "DUMP", async {
            redis::cmd("DUMP").arg(key).query_async(conn).await
        })
        .await?;

        match payload {
            Some(bytes) => Ok(ReadOutcome::Record(KeyRecord {
                key: key.to_string(),
                // The opaque payload short-circuits the kind switch; the
                // tag is nominal.
                kind: KeyKind::String,
                value: KeyValue::Dump(bytes),
                ttl_ms: ttl_ms.max(0),
            })),
            None => Ok(ReadOutcome::Missing),
        }
    }

    /// Apply a change event to a target connection.
    pub async fn apply(
        &self,
        conn: &mut ConnectionManager,
        event: &ChangeEvent,
        deadline: Duration,
    ) -> Result<()> {
        match &event.op {
            ChangeOp::Write(record) if record.is_tombstone() => {
                self.delete(conn, &record.key, deadline).await
            }
            ChangeOp::Write(record) => self.write_record(conn, record, deadline).await,
            ChangeOp::Delete(key) => self.delete(conn, key, deadline).await,
            ChangeOp::FlushAll => {
                run(deadline, "FLUSHDB", async {
                    redis::cmd("FLUSHDB").query_async(conn).await
                })
                .await
            }
        }
    }

    async fn delete(
        &self,
        conn: &mut ConnectionManager,
        key: &str,
        deadline: Duration,
    ) -> Result<()> {
        let _removed: i64 = run(deadline, "DEL", async {
            redis::cmd("DEL").arg(key).query_async(conn).await
        })
        .await?;
        Ok(())
    }

    /// Write one record to a target, transactional at the per-key level.
    pub async fn write_record(
        &self,
        conn: &mut ConnectionManager,
        record: &KeyRecord,
        deadline: Duration,
    ) -> Result<()> {
        let ttl = self.effective_ttl(record.ttl_ms);

        match &record.value {
            KeyValue::Str(bytes) => {
                let mut cmd = redis::cmd("SET");
                cmd.arg(&record.key).arg(bytes.as_slice());
                if let Some(ms) = ttl {
                    cmd.arg("PX").arg(ms);
                }
                let _: () = run(deadline, "SET", async { cmd.query_async(conn).await }).await?;
            }
            KeyValue::Hash(pairs) => {
                self.delete(conn, &record.key, deadline).await?;
                if !pairs.is_empty() {
                    let mut cmd = redis::cmd("HSET");
                    cmd.arg(&record.key);
                    for (field, value) in pairs {
                        cmd.arg(field.as_slice()).arg(value.as_slice());
                    }
                    let _fields: i64 = run(deadline, "HSET", async { cmd.query_async(conn).await }).await?;
                }
                self.expire(conn, &record.key, ttl, deadline).await?;
            }
            KeyValue::List(items) => {
                self.delete(conn, &record.key, deadline).await?;
                if !items.is_empty() {
                    // RPUSH keeps source order: head first.
                    let mut cmd = redis::cmd("RPUSH");
                    cmd.arg(&record.key);
                    for item in items {
                        cmd.arg(item.as_slice());
                    }
                    let _len: i64 = run(deadline, "RPUSH", async { cmd.query_async(conn).await }).await?;
                }
                self.expire(conn, &record.key, ttl, deadline).await?;
            }
            KeyValue::Set(items) => {
                self.delete(conn, &record.key, deadline).await?;
                if !items.is_empty() {
                    let mut cmd = redis::cmd("SADD");
                    cmd.arg(&record.key);
                    for item in items {
                        cmd.arg(item.as_slice());
                    }
                    let _added: i64 = run(deadline, "SADD", async { cmd.query_async(conn).await }).await?;
                }
                self.expire(conn, &record.key, ttl, deadline).await?;
            }
            KeyValue::SortedSet(members) => {
                self.delete(conn, &record.key, deadline).await?;
                if !members.is_empty() {
                    let mut cmd = redis::cmd("ZADD");
                    cmd.arg(&record.key);
                    for (member, score) in members {
                        cmd.arg(*score).arg(member.as_slice());
                    }
                    let _added: i64 = run(deadline, "ZADD", async { cmd.query_async(conn).await }).await?;
                }
                self.expire(conn, &record.key, ttl, deadline).await?;
            }
            KeyValue::Stream(entries) => {
                self.delete(conn, &record.key, deadline).await?;
                for (id, fields) in entries {
                    let mut cmd = redis::cmd("XADD");
                    cmd.arg(&record.key).arg(id);
                    for (field, value) in fields {
                        cmd.arg(field.as_slice()).arg(value.as_slice());
                    }
                    let _id: String = run(deadline, "XADD", async { cmd.query_async(conn).await }).await?;
                }
                self.expire(conn, &record.key, ttl, deadline).await?;
            }
            KeyValue::Dump(payload) => {
                let restore_ttl = ttl.unwrap_or(0);
                let mut cmd = redis::cmd("RESTORE");
                cmd.arg(&record.key)
                    .arg(restore_ttl)
                    .arg(payload.as_slice())
                    .arg("REPLACE");
                let _: () = run(deadline, "RESTORE", async { cmd.query_async(conn).await }).await?;
            }
        }

        debug!(key = %record.key, kind = record.kind.type_name(), ttl_ms = record.ttl_ms, "Applied record");
        Ok(())
    }

    async fn expire(
        &self,
        conn: &mut ConnectionManager,
        key: &str,
        ttl: Option<i64>,
        deadline: Duration,
    ) -> Result<()> {
        if let Some(ms) = ttl {
            let _set: i64 = run(deadline, "PEXPIRE", async {
                redis::cmd("PEXPIRE").arg(key).arg(ms).query_async(conn).await
            })
            .await?;
        }
        Ok(())
    }

    /// Positive TTLs carry over when `preserve_ttl` is set; everything else
    /// means "write without expiry".
    fn effective_ttl(&self, ttl_ms: i64) -> Option<i64> {
        if self.preserve_ttl && ttl_ms > 0 {
            Some(ttl_ms)
        } else {
            None
        }
    }
}

/// Run one command under the per-operation deadline.
async fn run<T>(
    deadline: Duration,
    operation: &'static str,
    fut: impl std::future::Future<Output = redis::RedisResult<T>>,
) -> Result<T> {
    match timeout(deadline, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(SyncError::redis(operation, e)),
        Err(_) => Err(SyncError::redis_msg(operation, "deadline exceeded")),
    }
}

/// RESTORE failed because source and target disagree on the payload
/// version; the per-key fallback path should take over.
pub fn is_restore_version_mismatch(err: &SyncError) -> bool {
    match err {
        SyncError::Redis { operation, message, .. } if operation == "RESTORE" => {
            message.contains("Bad data format") || message.contains("payload version")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_ttl_preserving() {
        let codec = ValueCodec::new(true);
        assert_eq!(codec.effective_ttl(60_000), Some(60_000));
        assert_eq!(codec.effective_ttl(1), Some(1));
        // Persistent and tombstone TTLs never become PEXPIRE.
        assert_eq!(codec.effective_ttl(0), None);
        assert_eq!(codec.effective_ttl(-1), None);
        assert_eq!(codec.effective_ttl(-2), None);
    }

    #[test]
    fn test_effective_ttl_disabled() {
        let codec = ValueCodec::new(false);
        assert_eq!(codec.effective_ttl(60_000), None);
        assert_eq!(codec.effective_ttl(0), None);
    }

    #[test]
    fn test_restore_version_mismatch_detection() {
        let mismatch = SyncError::redis_msg(
            "RESTORE",
            "DUMP payload version or checksum are wrong - Bad data format",
        );
        assert!(is_restore_version_mismatch(&mismatch));

        let busy = SyncError::redis_msg("RESTORE", "BUSYKEY Target key name already exists");
        assert!(!is_restore_version_mismatch(&busy));

        let other_op = SyncError::redis_msg("SET", "Bad data format");
        assert!(!is_restore_version_mismatch(&other_op));

        assert!(!is_restore_version_mismatch(&SyncError::Shutdown));
    }
}
