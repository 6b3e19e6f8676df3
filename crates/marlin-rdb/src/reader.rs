//! RDB snapshot parsing.
//!
//! File layout: the magic `REDIS` followed by a four-digit version, a run
//! of auxiliary fields, then per-database sections of key-value records
//! interleaved with opcodes (database selector, resize hints, expiry
//! timestamps), an EOF opcode, and a little-endian CRC-64 trailer over
//! everything before it.

use crate::{crc64, lzf};
use bytes::{Buf, Bytes};
use marlin_common::{MarlinError, Result};
use std::io::ErrorKind;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Opcodes.
const OP_AUX: u8 = 250; // auxiliary field
const OP_RESIZE_DB: u8 = 251; // hash table resize hint
const OP_EXPIRE_TIME_MS: u8 = 252; // expiry in milliseconds
const OP_EXPIRE_TIME_S: u8 = 253; // expiry in seconds
const OP_SELECT_DB: u8 = 254; // database selector
const OP_EOF: u8 = 255;

// Value type encodings. Only plain strings are supported.
const ENC_STRING: u8 = 0;

// Special string formats (length encoding with the two high bits set).
const FMT_INT8: u8 = 0;
const FMT_INT16: u8 = 1;
const FMT_INT32: u8 = 2;
const FMT_LZF: u8 = 3;

/// One key-value pair loaded from a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    /// Logical database the key belongs to.
    pub db_index: usize,
    pub key: String,
    /// Only string values survive a snapshot; streams are not persisted.
    pub value: String,
    /// Absolute expiry deadline, if the key had one.
    pub expires_at: Option<SystemTime>,
}

/// A parsed snapshot.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Format version from the header.
    pub version: u32,
    /// Auxiliary metadata fields (redis-ver, creation time, ...).
    pub aux: Vec<(String, String)>,
    pub records: Vec<SnapshotRecord>,
}

/// Reads and parses a snapshot file.
///
/// A missing file is not an error: the server simply starts empty, so this
/// returns `Ok(None)`.
pub fn read_snapshot_file(path: &Path) -> Result<Option<Snapshot>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    parse_snapshot(&data).map(Some)
}

/// Parses a snapshot from an in-memory buffer.
pub fn parse_snapshot(data: &[u8]) -> Result<Snapshot> {
    if data.len() < 9 || &data[..5] != b"REDIS" {
        return Err(MarlinError::SnapshotMagic);
    }
    if data.len() < 9 + 8 {
        return Err(MarlinError::SnapshotCorrupted(
            "file too short for checksum trailer".to_string(),
        ));
    }
    verify_checksum(data)?;

    let version: u32 = std::str::from_utf8(&data[5..9])
        .ok()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| MarlinError::SnapshotCorrupted("bad version field".to_string()))?;

    let mut cur = Cursor::new(Bytes::copy_from_slice(&data[9..data.len() - 8]));
    let aux = read_aux_fields(&mut cur)?;
    let records = read_databases(&mut cur)?;

    Ok(Snapshot {
        version,
        aux,
        records,
    })
}

/// Verifies the CRC-64 trailer. Writers may emit a zeroed trailer to opt
/// out of checksumming; that is accepted.
fn verify_checksum(data: &[u8]) -> Result<()> {
    let body_len = data.len() - 8;
    let mut trailer = [0u8; 8];
    trailer.copy_from_slice(&data[body_len..]);
    let stored = u64::from_le_bytes(trailer);
    if stored == 0 {
        return Ok(());
    }
    let computed = crc64::checksum(&data[..body_len]);
    if computed != stored {
        return Err(MarlinError::SnapshotChecksum { stored, computed });
    }
    Ok(())
}

/// Parses the run of auxiliary fields that follows the header.
fn read_aux_fields(cur: &mut Cursor) -> Result<Vec<(String, String)>> {
    let mut aux = Vec::new();
    while cur.peek() == Some(OP_AUX) {
        cur.u8()?;
        let key = read_string(cur)?;
        let value = read_string(cur)?;
        aux.push((key, value));
    }
    Ok(aux)
}

/// Parses every database section up to the EOF opcode.
fn read_databases(cur: &mut Cursor) -> Result<Vec<SnapshotRecord>> {
    let mut records = Vec::new();
    let mut db_index = 0usize;

    loop {
        let opcode = cur.u8()?;
        match opcode {
            OP_EOF => return Ok(records),

            OP_SELECT_DB => {
                db_index = read_plain_length(cur, "database selector")?;
            }

            OP_RESIZE_DB => {
                // Table size hints; parsed and discarded.
                read_plain_length(cur, "resize hint")?;
                read_plain_length(cur, "resize hint")?;
            }

            OP_EXPIRE_TIME_S => {
                let secs = cur.u32_le()?;
                let expires_at = UNIX_EPOCH + Duration::from_secs(u64::from(secs));
                let (key, value) = read_key_value(cur)?;
                records.push(SnapshotRecord {
                    db_index,
                    key,
                    value,
                    expires_at: Some(expires_at),
                });
            }

            OP_EXPIRE_TIME_MS => {
                let millis = cur.u64_le()?;
                let expires_at = UNIX_EPOCH + Duration::from_millis(millis);
                let (key, value) = read_key_value(cur)?;
                records.push(SnapshotRecord {
                    db_index,
                    key,
                    value,
                    expires_at: Some(expires_at),
                });
            }

            // Anything else is the value-type byte of a plain record.
            value_type => {
                let (key, value) = read_key_value_typed(cur, value_type)?;
                records.push(SnapshotRecord {
                    db_index,
                    key,
                    value,
                    expires_at: None,
                });
            }
        }
    }
}

fn read_key_value(cur: &mut Cursor) -> Result<(String, String)> {
    let value_type = cur.u8()?;
    read_key_value_typed(cur, value_type)
}

fn read_key_value_typed(cur: &mut Cursor, value_type: u8) -> Result<(String, String)> {
    let key = read_string(cur)?;
    match value_type {
        ENC_STRING => Ok((key, read_string(cur)?)),
        other => Err(MarlinError::UnsupportedEncoding(other)),
    }
}

/// A length field: either a byte count or a special-format marker.
enum Length {
    Plain(usize),
    Special(u8),
}

/// Parses the RDB length encoding. The two high bits of the first byte
/// select the form: 6 bits inline, 14 bits over two bytes, a 32-bit
/// big-endian word, or a special string format.
fn read_length(cur: &mut Cursor) -> Result<Length> {
    let first = cur.u8()?;
    match first >> 6 {
        0 => Ok(Length::Plain(usize::from(first & 0x3f))),
        1 => {
            let next = cur.u8()?;
            Ok(Length::Plain(
                usize::from(first & 0x3f) << 8 | usize::from(next),
            ))
        }
        2 => {
            let len = cur.u32_be()?;
            Ok(Length::Plain(len as usize))
        }
        _ => Ok(Length::Special(first & 0x3f)),
    }
}

/// Parses a length that must not be a special format.
fn read_plain_length(cur: &mut Cursor, what: &str) -> Result<usize> {
    match read_length(cur)? {
        Length::Plain(len) => Ok(len),
        Length::Special(_) => Err(MarlinError::SnapshotCorrupted(format!(
            "special-format length in {what}"
        ))),
    }
}

/// Parses a string, which may be raw bytes, an inline integer, or an
/// LZF-compressed blob.
fn read_string(cur: &mut Cursor) -> Result<String> {
    let len = match read_length(cur)? {
        Length::Plain(len) => len,
        Length::Special(FMT_INT8) => return Ok((cur.u8()? as i8).to_string()),
        Length::Special(FMT_INT16) => return Ok(cur.i16_le()?.to_string()),
        Length::Special(FMT_INT32) => return Ok(cur.i32_le()?.to_string()),
        Length::Special(FMT_LZF) => {
            let compressed_len = read_plain_length(cur, "compressed string")?;
            let uncompressed_len = read_plain_length(cur, "compressed string")?;
            let blob = cur.take(compressed_len)?;
            let raw = lzf::decompress(&blob, uncompressed_len)?;
            return Ok(String::from_utf8_lossy(&raw).into_owned());
        }
        Length::Special(other) => {
            return Err(MarlinError::SnapshotCorrupted(format!(
                "unknown string format {other}"
            )))
        }
    };
    let raw = cur.take(len)?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

/// Bounds-checked reader over the snapshot body.
struct Cursor {
    data: Bytes,
}

impl Cursor {
    fn new(data: Bytes) -> Self {
        Self { data }
    }

    fn peek(&self) -> Option<u8> {
        self.data.first().copied()
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.data.get_u8())
    }

    fn u32_le(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.data.get_u32_le())
    }

    fn u32_be(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.data.get_u32())
    }

    fn u64_le(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.data.get_u64_le())
    }

    fn i16_le(&mut self) -> Result<i16> {
        self.need(2)?;
        Ok(self.data.get_i16_le())
    }

    fn i32_le(&mut self) -> Result<i32> {
        self.need(4)?;
        Ok(self.data.get_i32_le())
    }

    fn take(&mut self, n: usize) -> Result<Bytes> {
        self.need(n)?;
        Ok(self.data.split_to(n))
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.data.remaining() < n {
            return Err(MarlinError::SnapshotCorrupted(
                "unexpected end of file".to_string(),
            ));
        }
        Ok(())
    }
}
