// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Incremental RESP reader for the replication command stream.
//!
//! After a full resync the socket becomes a stream of inline RESP arrays
//! (`*N\r\n$len\r\n...`). This parser is fed raw chunks as they arrive and
//! yields one complete command at a time together with its exact encoded
//! byte length, so the replication offset can be advanced only after a
//! command has fully parsed: never mid-command.
//!
//! Masters also interleave bare `\n` keepalives into the stream; those are
//! consumed and counted like any other stream bytes.
//!
//! The buffer is bounded: a single element larger than
//! [`MAX_COMMAND_BYTES`] is a protocol error rather than an unbounded
//! allocation.

use bytes::{Buf, BytesMut};

use crate::error::{Result, SyncError};

/// Upper bound on one command's encoded size (512 MiB, the Redis
/// proto-max-bulk-len default).
pub const MAX_COMMAND_BYTES: usize = 512 * 1024 * 1024;

/// A parsed inline command plus the exact number of stream bytes it
/// occupied (including any leading keepalive newlines consumed before it).
#[derive(Debug, Clone, PartialEq)]
pub struct StreamCommand {
    pub args: Vec<Vec<u8>>,
    pub stream_bytes: u64,
}

impl StreamCommand {
    /// Uppercased command name.
    pub fn name(&self) -> String {
        self.args
            .first()
            .map(|a| String::from_utf8_lossy(a).to_ascii_uppercase())
            .unwrap_or_default()
    }

    /// Argument at `idx` as UTF-8, if present.
    pub fn arg_str(&self, idx: usize) -> Option<String> {
        self.args.get(idx).map(|a| String::from_utf8_lossy(a).into_owned())
    }
}

/// Push-based RESP array parser over a growable buffer.
pub struct RespParser {
    buf: BytesMut,
    /// Keepalive bytes consumed while waiting for the next command; folded
    /// into that command's `stream_bytes` so the offset never loses them.
    pending_skip: u64,
}

impl Default for RespParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RespParser {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(16 * 1024),
            pending_skip: 0,
        }
    }

    /// Append raw bytes received from the socket.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes currently buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Try to pop one complete command.
    ///
    /// Returns `Ok(None)` when the buffer holds only a partial command;
    /// feed more bytes and retry. Consumed bytes (keepalives + the full
    /// command encoding) are reported in [`StreamCommand::stream_bytes`].
    pub fn next_command(&mut self) -> Result<Option<StreamCommand>> {
        // Swallow inline keepalives between commands.
        while let Some(&b) = self.buf.first() {
            if b == b'\n' || b == b'\r' {
                self.buf.advance(1);
                self.pending_skip += 1;
            } else {
                break;
            }
        }

        let Some(&first) = self.buf.first() else {
            return Ok(None);
        };
        if first != b'*' {
            return Err(SyncError::RespParse(format!(
                "expected array marker '*', got 0x{:02x}",
                first
            )));
        }

        // Parse against an immutable view; only advance the buffer once
        // the whole command is present.
        let view = &self.buf[..];
        let mut pos = 0usize;

        let Some((array_len, header_len)) = read_length_line(view, pos, b'*')? else {
            return Ok(None);
        };
        pos += header_len;

        if array_len < 0 {
            return Err(SyncError::RespParse("negative array length".to_string()));
        }

        let mut args = Vec::with_capacity(array_len as usize);
        for _ in 0..array_len {
            if pos >= view.len() {
                return Ok(None);
            }
            let Some((elem_len, len_line)) = read_length_line(view, pos, b'$')? else {
                return Ok(None);
            };
            pos += len_line;

            if elem_len < 0 {
                return Err(SyncError::RespParse("null bulk in command array".to_string()));
            }
            let elem_len = elem_len as usize;
            if elem_len > MAX_COMMAND_BYTES {
                return Err(SyncError::RespParse(format!(
                    "bulk of {} bytes exceeds limit",
                    elem_len
                )));
            }

            if pos + elem_len + 2 > view.len() {
                return Ok(None);
            }
            args.push(view[pos..pos + elem_len].to_vec());
            if &view[pos + elem_len..pos + elem_len + 2] != b"\r\n" {
                return Err(SyncError::RespParse("bulk not CRLF-terminated".to_string()));
            }
            pos += elem_len + 2;
        }

        self.buf.advance(pos);
        let stream_bytes = self.pending_skip + pos as u64;
        self.pending_skip = 0;
        Ok(Some(StreamCommand {
            args,
            stream_bytes,
        }))
    }
}

/// Parse a `<marker><decimal>\r\n` length line starting at `pos`.
///
/// Returns `Ok(None)` if the line is not complete yet, otherwise the value
/// and the number of bytes the line occupies.
fn read_length_line(view: &[u8], pos: usize, marker: u8) -> Result<Option<(i64, usize)>> {
    if pos >= view.len() {
        return Ok(None);
    }
    if view[pos] != marker {
        return Err(SyncError::RespParse(format!(
            "expected '{}' marker, got 0x{:02x}",
            marker as char, view[pos]
        )));
    }

    let rest = &view[pos + 1..];
    let Some(crlf) = find_crlf(rest) else {
        // Guard against a runaway header with no CRLF in sight.
        if rest.len() > 32 {
            return Err(SyncError::RespParse("length line too long".to_string()));
        }
        return Ok(None);
    };

    let digits = &rest[..crlf];
    let text = std::str::from_utf8(digits)
        .map_err(|_| SyncError::RespParse("non-UTF8 length".to_string()))?;
    let value: i64 = text
        .parse()
        .map_err(|_| SyncError::RespParse(format!("bad length '{}'", text)))?;

    // marker + digits + CRLF
    Ok(Some((value, 1 + crlf + 2)))
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

/// Encode a command as a RESP array (outbound REPLCONF ACK etc.).
pub fn encode_command(args: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(32);
    out.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(args: &[&str]) -> Vec<u8> {
        let byte_args: Vec<&[u8]> = args.iter().map(|a| a.as_bytes()).collect();
        encode_command(&byte_args)
    }

    #[test]
    fn test_encode_command() {
        let encoded = encode(&["REPLCONF", "ACK", "12345"]);
        assert_eq!(
            encoded,
            b"*3\r\n$8\r\nREPLCONF\r\n$3\r\nACK\r\n$5\r\n12345\r\n"
        );
    }

    #[test]
    fn test_parse_single_command() {
        let mut parser = RespParser::new();
        let encoded = encode(&["SET", "user:1", "alice"]);
        parser.feed(&encoded);

        let cmd = parser.next_command().unwrap().unwrap();
        assert_eq!(cmd.name(), "SET");
        assert_eq!(cmd.args.len(), 3);
        assert_eq!(cmd.arg_str(1).unwrap(), "user:1");
        assert_eq!(cmd.stream_bytes, encoded.len() as u64);
        assert_eq!(parser.buffered(), 0);

        // No more commands.
        assert!(parser.next_command().unwrap().is_none());
    }

    #[test]
    fn test_parse_across_chunk_boundary() {
        let mut parser = RespParser::new();
        let encoded = encode(&["SET", "k", "value"]);

        // Feed one byte at a time; only the final byte completes the command.
        for (i, byte) in encoded.iter().enumerate() {
            parser.feed(&[*byte]);
            let result = parser.next_command().unwrap();
            if i + 1 < encoded.len() {
                assert!(result.is_none(), "premature parse at byte {}", i);
            } else {
                let cmd = result.unwrap();
                assert_eq!(cmd.name(), "SET");
                assert_eq!(cmd.stream_bytes, encoded.len() as u64);
            }
        }
    }

    #[test]
    fn test_parse_back_to_back_commands() {
        let mut parser = RespParser::new();
        let a = encode(&["SET", "a", "1"]);
        let b = encode(&["DEL", "a"]);
        parser.feed(&a);
        parser.feed(&b);

        let first = parser.next_command().unwrap().unwrap();
        assert_eq!(first.name(), "SET");
        assert_eq!(first.stream_bytes, a.len() as u64);

        let second = parser.next_command().unwrap().unwrap();
        assert_eq!(second.name(), "DEL");
        assert_eq!(second.stream_bytes, b.len() as u64);
    }

    #[test]
    fn test_keepalive_newlines_counted() {
        let mut parser = RespParser::new();
        let encoded = encode(&["PING"]);
        parser.feed(b"\n\n");
        parser.feed(&encoded);

        let cmd = parser.next_command().unwrap().unwrap();
        assert_eq!(cmd.name(), "PING");
        // Keepalives are stream bytes too; the offset must cover them.
        assert_eq!(cmd.stream_bytes, 2 + encoded.len() as u64);
    }

    #[test]
    fn test_binary_safe_payload() {
        let mut parser = RespParser::new();
        let payload = vec![0u8, 1, 2, 255, 254, b'\r', b'\n', 0];
        let mut encoded = b"*3\r\n$3\r\nSET\r\n$3\r\nbin\r\n".to_vec();
        encoded.extend_from_slice(format!("${}\r\n", payload.len()).as_bytes());
        encoded.extend_from_slice(&payload);
        encoded.extend_from_slice(b"\r\n");
        parser.feed(&encoded);

        let cmd = parser.next_command().unwrap().unwrap();
        assert_eq!(cmd.args[2], payload);
        assert_eq!(cmd.stream_bytes, encoded.len() as u64);
    }

    #[test]
    fn test_garbage_is_error() {
        let mut parser = RespParser::new();
        parser.feed(b"+OK\r\n");
        assert!(parser.next_command().is_err());
    }

    #[test]
    fn test_unterminated_bulk_is_error() {
        let mut parser = RespParser::new();
        // Bulk claims 1 byte but is followed by garbage instead of CRLF.
        parser.feed(b"*1\r\n$1\r\nXYZ\r\n");
        assert!(parser.next_command().is_err());
    }

    #[test]
    fn test_oversized_bulk_rejected() {
        let mut parser = RespParser::new();
        parser.feed(format!("*1\r\n${}\r\n", MAX_COMMAND_BYTES + 1).as_bytes());
        assert!(parser.next_command().is_err());
    }

    #[test]
    fn test_empty_buffer() {
        let mut parser = RespParser::new();
        assert!(parser.next_command().unwrap().is_none());
    }

    #[test]
    fn test_keepalive_before_command_arrives_not_lost() {
        let mut parser = RespParser::new();
        parser.feed(b"\n");
        // Keepalive alone: no command yet, but the byte must not vanish.
        assert!(parser.next_command().unwrap().is_none());

        let encoded = encode(&["PING"]);
        parser.feed(&encoded);
        let cmd = parser.next_command().unwrap().unwrap();
        assert_eq!(cmd.stream_bytes, 1 + encoded.len() as u64);
    }

    #[test]
    fn test_stream_bytes_sum_matches_feed() {
        // Offset discipline: the per-command byte counts must add up to
        // exactly what went over the wire.
        let mut parser = RespParser::new();
        let mut wire = Vec::new();
        wire.extend_from_slice(b"\n");
        wire.extend_from_slice(&encode(&["SET", "k1", "v1"]));
        wire.extend_from_slice(&encode(&["HSET", "h", "f", "v"]));
        wire.extend_from_slice(b"\n");
        wire.extend_from_slice(&encode(&["DEL", "k1"]));
        parser.feed(&wire);

        let mut total = 0u64;
        while let Some(cmd) = parser.next_command().unwrap() {
            total += cmd.stream_bytes;
        }
        assert_eq!(total, wire.len() as u64);
    }
}
