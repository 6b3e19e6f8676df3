//! Incremental RESP command decoding.

use bytes::{Buf, BytesMut};
use marlin_common::{MarlinError, Result};

/// Upper bound on elements in one command array.
const MAX_COMMAND_LEN: usize = 1024 * 1024;

/// Upper bound on a single bulk string argument (512 MB, the Redis limit).
const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Tries to decode one complete command (a RESP array of bulk strings)
/// from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer holds only a prefix of a command;
/// the caller should read more bytes and retry. On success the consumed
/// bytes are removed from `buf`, so pipelined commands can be decoded by
/// calling again. A malformed buffer is unrecoverable for the connection.
pub fn decode_command(buf: &mut BytesMut) -> Result<Option<Vec<String>>> {
    let mut pos = 0;

    let header = match read_line(buf, &mut pos) {
        Some(line) => line,
        None => return Ok(None),
    };
    if header.first() != Some(&b'*') {
        return Err(MarlinError::Protocol(format!(
            "expected array marker '*', got {:?}",
            header.first().map(|&b| b as char)
        )));
    }
    let count = parse_length(&header[1..], "array")?;
    if count > MAX_COMMAND_LEN {
        return Err(MarlinError::Protocol(format!(
            "array length {count} too large"
        )));
    }

    let mut command = Vec::with_capacity(count);
    for _ in 0..count {
        let header = match read_line(buf, &mut pos) {
            Some(line) => line,
            None => return Ok(None),
        };
        if header.first() != Some(&b'$') {
            return Err(MarlinError::Protocol(format!(
                "expected bulk string marker '$', got {:?}",
                header.first().map(|&b| b as char)
            )));
        }
        let len = parse_length(&header[1..], "bulk string")?;
        if len > MAX_BULK_LEN {
            return Err(MarlinError::Protocol(format!(
                "bulk string length {len} too large"
            )));
        }

        // Payload plus its trailing CRLF.
        if buf.len() < pos + len + 2 {
            return Ok(None);
        }
        let payload = &buf[pos..pos + len];
        if &buf[pos + len..pos + len + 2] != b"\r\n" {
            return Err(MarlinError::Protocol(
                "bulk string missing CRLF terminator".to_string(),
            ));
        }
        let arg = String::from_utf8(payload.to_vec())
            .map_err(|_| MarlinError::Protocol("argument is not valid UTF-8".to_string()))?;
        command.push(arg);
        pos += len + 2;
    }

    buf.advance(pos);
    Ok(Some(command))
}

/// Returns the next CRLF-terminated line starting at `*pos`, advancing
/// `*pos` past the terminator. `None` when no full line is buffered yet.
/// A stray LF without a CR stays part of the line and fails downstream
/// parsing.
fn read_line<'a>(buf: &'a BytesMut, pos: &mut usize) -> Option<&'a [u8]> {
    let start = *pos;
    let end = buf[start..].windows(2).position(|w| w == b"\r\n")? + start;
    *pos = end + 2;
    Some(&buf[start..end])
}

/// Parses a decimal length field.
fn parse_length(digits: &[u8], what: &str) -> Result<usize> {
    if digits.is_empty() {
        return Err(MarlinError::Protocol(format!("empty {what} length")));
    }
    let mut total: usize = 0;
    for &byte in digits {
        if !byte.is_ascii_digit() {
            return Err(MarlinError::Protocol(format!(
                "invalid {what} length byte {:?}",
                byte as char
            )));
        }
        total = total
            .checked_mul(10)
            .and_then(|t| t.checked_add((byte - b'0') as usize))
            .ok_or_else(|| MarlinError::Protocol(format!("{what} length overflow")))?;
    }
    Ok(total)
}
