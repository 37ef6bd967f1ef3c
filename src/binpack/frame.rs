//! Per-frame compression for binpack payloads.
//!
//! A file is cut into frames of at most [`FRAME_MAX`] bytes and each frame is
//! written as `<4-byte header><payload>`. The header is a little-endian `u32`:
//! bits 0..=30 hold the original (uncompressed) frame length and bit 31 is set
//! when the payload is stored raw. Compressed payloads are raw DEFLATE streams,
//! which are self-terminating, so the reader finds the next header by asking
//! the inflater how much input it consumed.
//!
//! Bounding frames keeps the unpacking peer's memory use to one frame.
use flate2::write::DeflateEncoder;
use flate2::{Compression, Decompress, FlushDecompress, Status};
use std::io::Write;

/// Largest uncompressed frame we emit or accept.
pub const FRAME_MAX: usize = 8192;

/// Size of the per-frame header in bytes.
pub const HEADER_LEN: usize = 4;

const STORED_FLAG: u32 = 0x8000_0000;
const LEN_MASK: u32 = 0x7FFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Original frame length.
    pub len: u32,
    /// Payload is the raw frame (`len` bytes) rather than DEFLATE data.
    pub stored: bool,
}

impl FrameHeader {
    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut word = self.len & LEN_MASK;
        if self.stored {
            word |= STORED_FLAG;
        }
        word.to_le_bytes()
    }

    pub fn from_bytes(bytes: [u8; HEADER_LEN]) -> Self {
        let word = u32::from_le_bytes(bytes);
        FrameHeader {
            len: word & LEN_MASK,
            stored: word & STORED_FLAG != 0,
        }
    }
}

/// Running totals from [`compress_frames`], handy for logging.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub frames: usize,
    pub stored: usize,
}

/// Compress `data` frame by frame, appending frames to `out`.
pub fn compress_frames(data: &[u8], out: &mut Vec<u8>) -> std::io::Result<FrameStats> {
    let mut stats = FrameStats::default();
    for frame in data.chunks(FRAME_MAX) {
        let mut enc = DeflateEncoder::new(Vec::with_capacity(frame.len()), Compression::best());
        enc.write_all(frame)?;
        let packed = enc.finish()?;

        let stored = packed.len() >= frame.len();
        let header = FrameHeader {
            len: frame.len() as u32,
            stored,
        };
        out.extend_from_slice(&header.to_bytes());
        if stored {
            out.extend_from_slice(frame);
            stats.stored += 1;
        } else {
            out.extend_from_slice(&packed);
        }
        stats.frames += 1;
    }
    Ok(stats)
}

/// Why a frame could not be decoded; the caller attaches file context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameFault {
    TruncatedHeader,
    Oversize(u32),
    TruncatedPayload { needed: usize, remaining: usize },
    Inflate(String),
    ShortFrame { declared: u32, produced: usize },
}

impl std::fmt::Display for FrameFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameFault::TruncatedHeader => write!(f, "truncated frame header"),
            FrameFault::Oversize(len) => {
                write!(f, "frame declares {} bytes (max {})", len, FRAME_MAX)
            }
            FrameFault::TruncatedPayload { needed, remaining } => {
                write!(f, "stored frame needs {} bytes, {} remain", needed, remaining)
            }
            FrameFault::Inflate(msg) => write!(f, "inflate failed: {}", msg),
            FrameFault::ShortFrame { declared, produced } => write!(
                f,
                "frame inflated to {} bytes, header declares {}",
                produced, declared
            ),
        }
    }
}

/// Decode a span of frames back into the original bytes.
///
/// On failure returns the byte offset (within `span`) of the offending frame.
pub fn decompress_frames(span: &[u8], out: &mut Vec<u8>) -> Result<(), (usize, FrameFault)> {
    let mut pos = 0;
    while pos < span.len() {
        let at = pos;
        let raw: [u8; HEADER_LEN] = span
            .get(pos..pos + HEADER_LEN)
            .and_then(|h| h.try_into().ok())
            .ok_or((at, FrameFault::TruncatedHeader))?;
        let header = FrameHeader::from_bytes(raw);
        pos += HEADER_LEN;

        let len = header.len as usize;
        if len > FRAME_MAX {
            return Err((at, FrameFault::Oversize(header.len)));
        }

        if header.stored {
            let remaining = span.len() - pos;
            if len > remaining {
                return Err((at, FrameFault::TruncatedPayload { needed: len, remaining }));
            }
            out.extend_from_slice(&span[pos..pos + len]);
            pos += len;
            continue;
        }

        let mut inflater = Decompress::new(false);
        // One byte of slack so an over-long stream shows up as a length error
        // rather than stalling on a full output buffer.
        let mut frame = Vec::with_capacity(len + 1);
        let status = inflater
            .decompress_vec(&span[pos..], &mut frame, FlushDecompress::Finish)
            .map_err(|e| (at, FrameFault::Inflate(e.to_string())))?;
        if status != Status::StreamEnd || frame.len() != len {
            return Err((
                at,
                FrameFault::ShortFrame {
                    declared: header.len,
                    produced: frame.len(),
                },
            ));
        }
        out.extend_from_slice(&frame);
        pos += inflater.total_in() as usize;
    }
    Ok(())
}
