//! LZF decompression for compressed RDB strings.
//!
//! LZF output is a sequence of chunks, each introduced by a control byte:
//! values below 32 announce a literal run of `ctrl + 1` bytes; anything
//! else is a back-reference of `(ctrl >> 5) + 2` bytes (plus an extension
//! byte when the 3-bit length saturates) at distance
//! `((ctrl & 0x1f) << 8 | next) + 1` behind the write position.

use marlin_common::{MarlinError, Result};

/// Decompresses `input`, which must expand to exactly `expected_len` bytes.
pub fn decompress(input: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(expected_len);
    let mut i = 0;

    while i < input.len() {
        let ctrl = usize::from(input[i]);
        i += 1;

        if ctrl < 32 {
            let run = ctrl + 1;
            if i + run > input.len() {
                return Err(corrupt("literal run past end of input"));
            }
            out.extend_from_slice(&input[i..i + run]);
            i += run;
        } else {
            let mut len = ctrl >> 5;
            if len == 7 {
                len += usize::from(
                    *input
                        .get(i)
                        .ok_or_else(|| corrupt("truncated length extension"))?,
                );
                i += 1;
            }
            len += 2;

            let low = usize::from(
                *input
                    .get(i)
                    .ok_or_else(|| corrupt("truncated back-reference"))?,
            );
            i += 1;
            let distance = ((ctrl & 0x1f) << 8) + low + 1;

            if distance > out.len() {
                return Err(corrupt("back-reference before start of output"));
            }
            let start = out.len() - distance;
            // Byte-at-a-time because the reference may overlap the bytes it
            // is producing.
            for j in 0..len {
                let byte = out[start + j];
                out.push(byte);
            }
        }
    }

    if out.len() != expected_len {
        return Err(corrupt("decompressed length mismatch"));
    }
    Ok(out)
}

fn corrupt(reason: &str) -> MarlinError {
    MarlinError::SnapshotCorrupted(format!("lzf: {reason}"))
}
