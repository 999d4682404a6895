//! Consistent Overhead Byte Stuffing
//!
//! COBS removes every zero byte from a buffer so that a single `0x00` can
//! mark frame boundaries on the wire. The input is split into runs ending at
//! a zero (or at 254 non-zero bytes); each run is emitted as a block-length
//! byte followed by the run's bytes.
//!
//! ```text
//! input:   11 22 00 33
//! encoded: 03 11 22 02 33
//! ```
//!
//! A block of length `0xFF` carries 254 data bytes and is *not* followed by
//! an implicit zero, which is how runs of 254 or more non-zero bytes survive
//! the round trip.

use crate::error::{ProtocolError, Result};

/// Largest block length byte; marks a full 254-byte run.
const MAX_BLOCK: u8 = 0xFF;

/// Worst-case encoded size for `len` input bytes.
#[inline]
pub const fn max_encoded_len(len: usize) -> usize {
    len + len / 254 + 1
}

/// Encode `src`, returning a buffer that contains no zero bytes.
pub fn encode(src: &[u8]) -> Vec<u8> {
    let mut dst = Vec::with_capacity(max_encoded_len(src.len()));
    let mut block_start = dst.len();
    dst.push(0);
    let mut block_len: u8 = 1;

    for &byte in src {
        if byte == 0 {
            dst[block_start] = block_len;
            block_start = dst.len();
            dst.push(0);
            block_len = 1;
        } else {
            dst.push(byte);
            block_len += 1;
            if block_len == MAX_BLOCK {
                dst[block_start] = block_len;
                block_start = dst.len();
                dst.push(0);
                block_len = 1;
            }
        }
    }
    dst[block_start] = block_len;

    dst
}

/// Decode a COBS buffer (without the delimiter).
///
/// Returns [`ProtocolError::BadEncoding`] if a block claims more bytes than
/// remain or the buffer contains a zero byte.
pub fn decode(src: &[u8]) -> Result<Vec<u8>> {
    let mut dst = Vec::with_capacity(src.len());
    let mut pos = 0;

    while pos < src.len() {
        let code = src[pos];
        if code == 0 {
            return Err(ProtocolError::BadEncoding);
        }
        pos += 1;

        let run = code as usize - 1;
        let end = pos + run;
        if end > src.len() {
            return Err(ProtocolError::BadEncoding);
        }
        let block = &src[pos..end];
        if block.contains(&0) {
            return Err(ProtocolError::BadEncoding);
        }
        dst.extend_from_slice(block);
        pos = end;

        if code < MAX_BLOCK && pos != src.len() {
            dst.push(0);
        }
    }

    Ok(dst)
}
