//! Stream entry ids and their internal key encoding.
//!
//! An entry id is a pair of unsigned 64-bit integers, written as
//! `"<ms>-<seq>"` in the textual protocol. Before an id touches the trie it
//! is normalized into an internal key: each half is encoded as an 11-digit
//! base-64 number (most significant digit first, zero-padded), and the two
//! halves are concatenated into a fixed 22-digit key. Every digit is a value
//! in `[0, 63]` and doubles as a bit offset into a node's child bitmap.
//!
//! The fixed width means every entry lives at trie depth 22, and comparing
//! two internal keys digit by digit gives the same order as comparing the
//! id pairs numerically. That invariant is what makes in-order traversal of
//! the trie produce entries in ascending id order.

use marlin_common::{MarlinError, Result};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Number of base-64 digits in an internal key.
pub const INTERNAL_LEN: usize = 22;

/// Digits used by each half of an internal key.
const HALF_LEN: usize = 11;

/// Internal representation of an entry id: 22 base-64 digits.
pub type InternalId = [u8; INTERNAL_LEN];

/// A stream entry id: a millisecond timestamp and a sequence number.
///
/// Ordering is lexicographic on `(ms, seq)`, which the derived `Ord` gives
/// us for free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EntryId {
    pub ms: u64,
    pub seq: u64,
}

impl EntryId {
    /// The lowest possible id. Reserved as the empty-stream sentinel; it can
    /// never be stored.
    pub const MIN: EntryId = EntryId { ms: 0, seq: 0 };

    /// The highest possible id.
    pub const MAX: EntryId = EntryId {
        ms: u64::MAX,
        seq: u64::MAX,
    };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Returns true if this is the lowest possible id.
    pub fn is_min(&self) -> bool {
        *self == Self::MIN
    }

    /// Returns true if this is the highest possible id.
    pub fn is_max(&self) -> bool {
        *self == Self::MAX
    }

    /// Returns the next higher id, e.g. `1-5` -> `1-6`.
    ///
    /// Wraps to `0-0` past the maximum; the second value reports the
    /// overflow.
    pub fn next(&self) -> (EntryId, bool) {
        let (seq, carry) = self.seq.overflowing_add(1);
        if !carry {
            return (EntryId::new(self.ms, seq), false);
        }
        let (ms, overflow) = self.ms.overflowing_add(1);
        (EntryId::new(ms, seq), overflow)
    }

    /// Returns the previous lower id, e.g. `1-5` -> `1-4`.
    ///
    /// Wraps to the maximum past `0-0`; the second value reports the
    /// underflow.
    pub fn prev(&self) -> (EntryId, bool) {
        let (seq, borrow) = self.seq.overflowing_sub(1);
        if !borrow {
            return (EntryId::new(self.ms, seq), false);
        }
        let (ms, underflow) = self.ms.overflowing_sub(1);
        (EntryId::new(ms, seq), underflow)
    }

    /// Returns the internal 22-digit base-64 key for this id.
    pub fn internal(&self) -> InternalId {
        let mut buf = [0u8; INTERNAL_LEN];
        encode_base64(&mut buf[..HALF_LEN], self.ms);
        encode_base64(&mut buf[HALF_LEN..], self.seq);
        buf
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

/// Encodes `val` as a base-64 number into `buf`, least significant digit at
/// the rightmost index, zero-padded on the left. `buf` must be 11 digits,
/// which is enough for any u64.
fn encode_base64(buf: &mut [u8], mut val: u64) {
    let mut i = buf.len();
    while val >= 64 {
        i -= 1;
        buf[i] = (val & 63) as u8;
        val >>= 6;
    }
    buf[i - 1] = val as u8;
}

/// Parses a textual entry id against the stream's most recent id.
///
/// Accepted forms:
/// - `"-"` is the lowest possible id, `"+"` the highest.
/// - `"*"` auto-generates from the wall clock: `ms` is milliseconds since
///   the epoch; if that equals `last.ms` the sequence continues from
///   `last.seq + 1`, otherwise it starts at 0.
/// - `"<ms>-<seq>"` with both halves base 10. An empty half is 0, so `"-1"`
///   equals `"0-1"` and `"1-"` equals `"1-0"`. A missing hyphen, a
///   non-digit character, or a half that overflows u64 is an error.
/// - `"<ms>-*"` auto-generates only the sequence, continuing from
///   `last.seq + 1` when the timestamps match.
pub fn parse_entry_id(text: &str, last: EntryId) -> Result<EntryId> {
    match text {
        "-" => return Ok(EntryId::MIN),
        "+" => return Ok(EntryId::MAX),
        "*" => {
            let ms = unix_time_ms();
            let seq = if ms == last.ms {
                last.seq.wrapping_add(1)
            } else {
                0
            };
            return Ok(EntryId::new(ms, seq));
        }
        _ => {}
    }

    let (left, right) = text
        .split_once('-')
        .ok_or_else(|| MarlinError::InvalidEntryId("no hyphen".to_string()))?;

    let ms = parse_decimal(left)?;
    let seq = if right == "*" {
        if ms == last.ms {
            last.seq.wrapping_add(1)
        } else {
            0
        }
    } else {
        parse_decimal(right)?
    };

    Ok(EntryId::new(ms, seq))
}

/// Parses a base-10 u64, treating the empty string as 0.
///
/// Hand-rolled rather than `str::parse` because the empty-side-is-zero rule
/// differs from the standard library and the error messages are part of the
/// protocol surface.
fn parse_decimal(digits: &str) -> Result<u64> {
    let mut total: u64 = 0;
    for byte in digits.bytes() {
        if !byte.is_ascii_digit() {
            return Err(MarlinError::InvalidEntryId(format!(
                "unexpected character '{}'",
                byte as char
            )));
        }
        total = total
            .checked_mul(10)
            .and_then(|t| t.checked_add(u64::from(byte - b'0')))
            .ok_or_else(|| MarlinError::InvalidEntryId("integer overflow".to_string()))?;
    }
    Ok(total)
}

/// Milliseconds since the Unix epoch, for auto-generated ids.
fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
