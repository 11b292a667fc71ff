// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Raw replication link to the source.
//!
//! The `redis` client cannot speak the replication subprotocol (SYNC,
//! PSYNC, the inline command stream), so the SYNC full-sync strategy and
//! the PSYNC driver share this thin buffered wrapper over a
//! `tokio::net::TcpStream`: TCP keepalive, AUTH, reply-line reads, and
//! RDB bulk consumption in both framings (length-prefixed and
//! `$EOF:`-delimited diskless).
//!
//! All reads go through one internal buffer, so bytes read past a reply
//! line are not lost: after the RDB bulk the leftover buffered bytes are
//! the head of the command stream.

use bytes::{Buf, BytesMut};
use socket2::{SockRef, TcpKeepalive};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::EndpointConfig;
use crate::error::{Result, SyncError};
use crate::resp::encode_command;

const READ_CHUNK: usize = 64 * 1024;
const EOF_MARK_LEN: usize = 40;

/// Outcome of one buffered read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    /// Bytes appended to the buffer.
    Data(usize),
    /// Peer closed the connection.
    Eof,
    /// Deadline elapsed with nothing received.
    TimedOut,
}

/// How the RDB bulk is framed.
#[derive(Debug, Clone, PartialEq)]
pub enum RdbFraming {
    /// `$<len>\r\n` followed by exactly `len` bytes, no trailing CRLF.
    Sized(u64),
    /// `$EOF:<40-byte mark>\r\n` followed by bytes until the mark repeats.
    Delimited([u8; EOF_MARK_LEN]),
}

/// Buffered raw connection to the source's replication port.
pub struct ReplLink {
    stream: TcpStream,
    buf: BytesMut,
}

impl ReplLink {
    /// Open the socket, set keepalive, and authenticate if needed.
    pub async fn connect(endpoint: &EndpointConfig) -> Result<Self> {
        let addr = format!("{}:{}", endpoint.host, endpoint.port);
        let stream = timeout(endpoint.connect_timeout(), TcpStream::connect(&addr))
            .await
            .map_err(|_| SyncError::SourceConnection {
                message: format!("connect to {} timed out", addr),
            })?
            .map_err(|e| SyncError::SourceConnection {
                message: format!("connect to {}: {}", addr, e),
            })?;

        stream.set_nodelay(true).ok();
        if endpoint.socket_keepalive {
            let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(60));
            SockRef::from(&stream).set_tcp_keepalive(&keepalive).ok();
        }

        let mut link = Self {
            stream,
            buf: BytesMut::with_capacity(READ_CHUNK),
        };

        if let Some(password) = &endpoint.password {
            link.send(&[b"AUTH", password.as_bytes()]).await?;
            let reply = link.read_line(endpoint.socket_timeout()).await?;
            if !reply.starts_with("+OK") {
                return Err(SyncError::Auth {
                    endpoint: "source".to_string(),
                    message: reply,
                });
            }
        }

        info!(address = %endpoint.address(), "Replication link established");
        Ok(link)
    }

    /// Send one command as a RESP array.
    pub async fn send(&mut self, args: &[&[u8]]) -> Result<()> {
        let encoded = encode_command(args);
        self.stream
            .write_all(&encoded)
            .await
            .map_err(|e| SyncError::SourceConnection {
                message: format!("replication write: {}", e),
            })?;
        Ok(())
    }

    /// Read more bytes into the internal buffer.
    pub async fn fill(&mut self, deadline: Duration) -> Result<FillOutcome> {
        let mut chunk = [0u8; READ_CHUNK];
        match timeout(deadline, self.stream.read(&mut chunk)).await {
            Ok(Ok(0)) => Ok(FillOutcome::Eof),
            Ok(Ok(n)) => {
                self.buf.extend_from_slice(&chunk[..n]);
                Ok(FillOutcome::Data(n))
            }
            Ok(Err(e)) => Err(SyncError::SourceConnection {
                message: format!("replication read: {}", e),
            }),
            Err(_) => Ok(FillOutcome::TimedOut),
        }
    }

    /// Drain all currently buffered bytes.
    pub fn take_buffered(&mut self) -> Vec<u8> {
        let out = self.buf.to_vec();
        self.buf.clear();
        out
    }

    /// Read one CRLF-terminated reply line (handshake replies, errors).
    pub async fn read_line(&mut self, deadline: Duration) -> Result<String> {
        loop {
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let line = self.buf[..pos].to_vec();
                self.buf.advance(pos + 2);
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }
            match self.fill(deadline).await? {
                FillOutcome::Data(_) => continue,
                FillOutcome::Eof => {
                    return Err(SyncError::SourceConnection {
                        message: "connection closed mid-reply".to_string(),
                    })
                }
                FillOutcome::TimedOut => {
                    return Err(SyncError::SourceConnection {
                        message: "reply deadline exceeded".to_string(),
                    })
                }
            }
        }
    }

    /// Read the RDB bulk header (`$<len>` or `$EOF:<mark>`).
    ///
    /// A `-ERR` reply here means the source refuses replication commands
    /// (managed offerings); surfaced as a protocol error so the caller can
    /// downgrade.
    pub async fn read_rdb_header(&mut self, deadline: Duration) -> Result<RdbFraming> {
        // Masters may send newline keepalives while the child produces
        // the RDB; skip them.
        let line = loop {
            let line = self.read_line(deadline).await?;
            let line = line.trim_start_matches('\n').to_string();
            if !line.is_empty() {
                break line;
            }
        };

        if let Some(rest) = line.strip_prefix('-') {
            return Err(SyncError::Protocol(format!("source refused: {}", rest)));
        }
        let Some(body) = line.strip_prefix('$') else {
            return Err(SyncError::Protocol(format!(
                "expected RDB bulk, got '{}'",
                line
            )));
        };

        if let Some(mark) = body.strip_prefix("EOF:") {
            let bytes = mark.as_bytes();
            if bytes.len() != EOF_MARK_LEN {
                return Err(SyncError::Protocol(format!(
                    "bad EOF mark length {}",
                    bytes.len()
                )));
            }
            let mut delim = [0u8; EOF_MARK_LEN];
            delim.copy_from_slice(bytes);
            Ok(RdbFraming::Delimited(delim))
        } else {
            let len: u64 = body
                .parse()
                .map_err(|_| SyncError::Protocol(format!("bad RDB length '{}'", body)))?;
            Ok(RdbFraming::Sized(len))
        }
    }

    /// Pull the next RDB payload chunk, or `None` once the payload is
    /// fully consumed. Leftover buffered bytes after the last chunk
    /// belong to the command stream.
    ///
    /// The pull shape lets callers await dispatch backpressure between
    /// chunks instead of buffering the whole snapshot.
    pub async fn next_rdb_chunk(
        &mut self,
        conduit: &mut RdbConduit,
        deadline: Duration,
    ) -> Result<Option<Vec<u8>>> {
        loop {
            match conduit {
                RdbConduit::Sized { remaining } => {
                    if *remaining == 0 {
                        return Ok(None);
                    }
                    if !self.buf.is_empty() {
                        let take = (self.buf.len() as u64).min(*remaining) as usize;
                        let chunk = self.buf[..take].to_vec();
                        self.buf.advance(take);
                        *remaining -= take as u64;
                        if *remaining == 0 {
                            debug!("RDB payload consumed");
                        }
                        return Ok(Some(chunk));
                    }
                    match self.fill(deadline).await? {
                        FillOutcome::Data(_) => {}
                        FillOutcome::Eof => {
                            return Err(SyncError::SourceConnection {
                                message: format!(
                                    "connection closed with {} RDB bytes left",
                                    remaining
                                ),
                            })
                        }
                        FillOutcome::TimedOut => {
                            return Err(SyncError::SourceConnection {
                                message: "RDB transfer stalled".to_string(),
                            })
                        }
                    }
                }
                RdbConduit::Delimited { mark, done } => {
                    if *done {
                        return Ok(None);
                    }
                    if let Some(pos) = find_subsequence(&self.buf, mark) {
                        let chunk = self.buf[..pos].to_vec();
                        self.buf.advance(pos + EOF_MARK_LEN);
                        *done = true;
                        debug!("Diskless RDB payload consumed");
                        return Ok(Some(chunk));
                    }
                    // Everything except a possible mark prefix at the tail
                    // is definitely payload.
                    if self.buf.len() > EOF_MARK_LEN {
                        let safe = self.buf.len() - EOF_MARK_LEN;
                        let chunk = self.buf[..safe].to_vec();
                        self.buf.advance(safe);
                        return Ok(Some(chunk));
                    }
                    match self.fill(deadline).await? {
                        FillOutcome::Data(_) => {}
                        FillOutcome::Eof => {
                            return Err(SyncError::SourceConnection {
                                message: "connection closed before EOF mark".to_string(),
                            })
                        }
                        FillOutcome::TimedOut => {
                            return Err(SyncError::SourceConnection {
                                message: "diskless RDB transfer stalled".to_string(),
                            })
                        }
                    }
                }
            }
        }
    }
}

/// Progress state for one RDB payload.
#[derive(Debug)]
pub enum RdbConduit {
    Sized { remaining: u64 },
    Delimited { mark: [u8; EOF_MARK_LEN], done: bool },
}

impl RdbConduit {
    pub fn new(framing: RdbFraming) -> Self {
        match framing {
            RdbFraming::Sized(len) => RdbConduit::Sized { remaining: len },
            RdbFraming::Delimited(mark) => RdbConduit::Delimited { mark, done: false },
        }
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
