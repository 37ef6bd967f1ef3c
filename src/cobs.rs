//! COBS (Consistent Overhead Byte Stuffing) with an optional delimiter XOR.
//!
//! Plain COBS removes every `0x00` from a buffer at a cost of one byte per run of
//! up to 254 literal bytes. Our links terminate packets with a different byte (a
//! line feed by default), so after stuffing we XOR the whole encoded frame with
//! that delimiter. Stuffed output never contains `0x00`, so the XORed output can
//! never contain the delimiter.
//!
//! Encoded layout is a sequence of blocks: a code byte `L` (1..=255) followed by
//! `L - 1` literal bytes. `L == 255` means no zero follows the block; any other
//! code means a zero separated this block from the next one in the original data.

use thiserror::Error;

/// Byte that stuffing removes from the output, regardless of the delimiter.
pub const ZERO: u8 = 0x00;

/// Longest literal run a single block can carry.
const MAX_RUN: usize = 254;

/// Code byte for a full block (no implicit zero follows).
const FULL_BLOCK: u8 = 0xFF;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CobsError {
    /// Nothing to decode. A valid frame is at least one code byte long.
    #[error("cobs: empty input")]
    EmptyInput,

    /// A zero byte showed up where only non-zero bytes are legal (a code byte or
    /// a literal), which means the stream was corrupted upstream.
    #[error("cobs: embedded zero at offset {offset}")]
    EmbeddedZero { offset: usize },

    /// A code byte claims more literals than the buffer still holds.
    #[error("cobs: code 0x{code:02x} at offset {offset} needs {needed} bytes, {remaining} remain")]
    LengthOutOfBounds {
        offset: usize,
        code: u8,
        needed: usize,
        remaining: usize,
    },
}

/// Worst-case encoded size for `raw_len` input bytes (no trailing delimiter).
pub const fn max_encoded_len(raw_len: usize) -> usize {
    raw_len + raw_len / MAX_RUN + 1
}

/// Encode `input`, then XOR the result with `delimiter` (a no-op for `0x00`).
///
/// Empty input encodes to a single code byte of `0x01` (before the XOR).
pub fn encode(input: &[u8], delimiter: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(max_encoded_len(input.len()));

    // Index of the code byte for the block currently being filled.
    let mut code_at = 0;
    let mut code: u8 = 1;
    out.push(0);

    for &b in input {
        if b == ZERO {
            out[code_at] = code;
            code_at = out.len();
            out.push(0);
            code = 1;
            continue;
        }
        out.push(b);
        code += 1;
        if code == FULL_BLOCK {
            out[code_at] = code;
            code_at = out.len();
            out.push(0);
            code = 1;
        }
    }
    out[code_at] = code;

    if delimiter != ZERO {
        for b in out.iter_mut() {
            *b ^= delimiter;
        }
    }
    out
}

/// Undo [`encode`]: strip the delimiter XOR, then unstuff.
///
/// `input` must not include the trailing packet delimiter.
pub fn decode(input: &[u8], delimiter: u8) -> Result<Vec<u8>, CobsError> {
    if input.is_empty() {
        return Err(CobsError::EmptyInput);
    }

    let mut out = Vec::with_capacity(input.len());
    let mut pos = 0;
    while pos < input.len() {
        let code = input[pos] ^ delimiter;
        if code == ZERO {
            return Err(CobsError::EmbeddedZero { offset: pos });
        }
        let literals = code as usize - 1;
        let remaining = input.len() - pos - 1;
        if literals > remaining {
            return Err(CobsError::LengthOutOfBounds {
                offset: pos,
                code,
                needed: literals,
                remaining,
            });
        }
        for (i, &raw) in input[pos + 1..pos + 1 + literals].iter().enumerate() {
            let b = raw ^ delimiter;
            if b == ZERO {
                return Err(CobsError::EmbeddedZero {
                    offset: pos + 1 + i,
                });
            }
            out.push(b);
        }
        pos += 1 + literals;
        if pos < input.len() && code != FULL_BLOCK {
            out.push(ZERO);
        }
    }
    Ok(out)
}
