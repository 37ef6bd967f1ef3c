//! # Binpack firmware containers
//!
//! A binpack bundles several firmware files, each destined for a load address
//! and region on the target, into one `.binpack` file:
//!
//! ```text
//! /// BINPACK ///
//! WHEN: 2026-10-19T12:00:00Z
//! HOST: stm32
//! SNAP: release-7
//! LOAD: boot.bin,0x08000000,0x00010000,40960,18233,<md5 of boot.bin>
//! LOAD: app.bin,0x08010000,0x00070000,301114,250877,<md5 of app.bin>
//! /// BINPACK ///
//! \0<frames of boot.bin><frames of app.bin>
//! ```
//!
//! Each LOAD line records the display name (commas stripped), load address,
//! region, uncompressed length, compressed length, and the MD5 of the
//! uncompressed file. Payload sections follow the NUL in LOAD order; their
//! lengths sum to the remainder of the container. See [`frame`] for the
//! per-frame encoding of each section.
//!
//! ```rust
//! use binlink::binpack::{pack, unpack, PackedFile};
//!
//! let files = vec![PackedFile {
//!     address: 0x0800_0000,
//!     region: 0x0001_0000,
//!     name: "boot.bin".to_string(),
//!     data: vec![0xFF; 20_000],
//! }];
//! let container = pack(&files).unwrap();
//! assert_eq!(unpack(&container).unwrap(), files);
//! ```

pub mod frame;

use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, info};
use md5::{Digest, Md5};
use thiserror::Error;

pub use frame::{FrameHeader, FRAME_MAX};

/// First and last line of the textual header.
pub const MAGIC: &str = "/// BINPACK ///";

/// Conventional file extension, without the dot.
pub const EXTENSION: &str = "binpack";

/// Files are limited by the 31-bit length field.
const MAX_FILE_LEN: usize = 0x7FFF_FFFF;

#[derive(Debug, Error)]
pub enum BinpackError {
    /// No NUL byte ends the header block.
    #[error("binpack: header is not NUL-terminated")]
    MissingTerminator,

    /// Header is not valid text or is missing its magic lines.
    #[error("binpack: bad header: {0}")]
    BadHeader(String),

    /// A LOAD line could not be parsed.
    #[error("binpack: bad LOAD line {line:?}: {reason}")]
    BadLoadLine { line: String, reason: String },

    /// Catalog lengths disagree with the bytes actually present or produced.
    #[error("binpack: {name}: expected {expected} bytes, found {actual}")]
    LengthMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    /// Reconstructed file does not hash to the catalog digest.
    #[error("binpack: {name}: md5 {actual} does not match catalog {expected}")]
    DigestMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    /// A frame inside a payload section is malformed.
    #[error("binpack: {name}: corrupt frame at +{offset}: {reason}")]
    CorruptFrame {
        name: String,
        offset: usize,
        reason: String,
    },

    /// File too large for the frame length field.
    #[error("binpack: {name} is {len} bytes, too large to pack")]
    FileTooLarge { name: String, len: usize },

    #[error("binpack io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BinpackError>;

/// One file in a container, in load order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedFile {
    pub address: u32,
    pub region: u32,
    pub name: String,
    pub data: Vec<u8>,
}

/// Catalog record for one file, as written on its LOAD line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub name: String,
    pub address: u32,
    pub region: u32,
    pub raw_len: usize,
    pub compressed_len: usize,
    pub md5: String,
}

/// Parsed header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    pub when: Option<DateTime<Utc>>,
    pub host: String,
    pub snapshot: String,
    pub entries: Vec<CatalogEntry>,
}

/// Values recorded in the header's WHEN/HOST/SNAP lines.
#[derive(Debug, Clone)]
pub struct PackOptions {
    pub host: String,
    pub snapshot: String,
    pub when: DateTime<Utc>,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            host: String::new(),
            snapshot: String::new(),
            when: Utc::now(),
        }
    }
}

/// Pack files with default header values (timestamped now).
pub fn pack(files: &[PackedFile]) -> Result<Vec<u8>> {
    pack_with(files, &PackOptions::default())
}

/// Pack files into a container, recording `opts` in the header.
pub fn pack_with(files: &[PackedFile], opts: &PackOptions) -> Result<Vec<u8>> {
    let mut entries = Vec::with_capacity(files.len());
    let mut payload = Vec::new();

    for file in files {
        let name = clean_name(&file.name);
        if file.data.len() > MAX_FILE_LEN {
            return Err(BinpackError::FileTooLarge {
                name,
                len: file.data.len(),
            });
        }
        let start = payload.len();
        let stats = frame::compress_frames(&file.data, &mut payload)?;
        let compressed_len = payload.len() - start;
        debug!(
            "binpack: {} -> {} frames ({} stored)",
            name, stats.frames, stats.stored
        );
        info!(
            "binpack: packed {} ({} -> {} bytes)",
            name,
            file.data.len(),
            compressed_len
        );
        entries.push(CatalogEntry {
            md5: md5_hex(&file.data),
            name,
            address: file.address,
            region: file.region,
            raw_len: file.data.len(),
            compressed_len,
        });
    }

    let catalog = Catalog {
        when: Some(opts.when),
        host: clean_value(&opts.host),
        snapshot: clean_value(&opts.snapshot),
        entries,
    };
    let mut out = catalog.render().into_bytes();
    out.push(0);
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Parse the header block, returning the catalog and the offset of the first
/// payload byte.
pub fn read_catalog(container: &[u8]) -> Result<(Catalog, usize)> {
    let nul = container
        .iter()
        .position(|&b| b == 0)
        .ok_or(BinpackError::MissingTerminator)?;
    let text = std::str::from_utf8(&container[..nul])
        .map_err(|e| BinpackError::BadHeader(format!("not utf-8: {}", e)))?;
    let catalog = Catalog::parse(text)?;

    let payload_len = container.len() - nul - 1;
    // Saturates on hostile lengths, which can never equal a real payload size.
    let cataloged = catalog
        .entries
        .iter()
        .fold(0usize, |acc, e| acc.saturating_add(e.compressed_len));
    if cataloged != payload_len {
        return Err(BinpackError::LengthMismatch {
            name: "payload".to_string(),
            expected: cataloged,
            actual: payload_len,
        });
    }
    Ok((catalog, nul + 1))
}

/// Reconstruct every file in the container, verifying lengths and digests.
pub fn unpack(container: &[u8]) -> Result<Vec<PackedFile>> {
    let (catalog, mut pos) = read_catalog(container)?;
    let mut files = Vec::with_capacity(catalog.entries.len());

    for entry in catalog.entries {
        let end = pos.saturating_add(entry.compressed_len);
        let span = container
            .get(pos..end)
            .ok_or_else(|| BinpackError::LengthMismatch {
                name: entry.name.clone(),
                expected: entry.compressed_len,
                actual: container.len().saturating_sub(pos),
            })?;
        pos = end;

        // Each frame yields at most FRAME_MAX bytes from a 4-byte header.
        let ceiling = (span.len() / frame::HEADER_LEN).saturating_mul(FRAME_MAX);
        let mut data = Vec::with_capacity(entry.raw_len.min(ceiling));
        frame::decompress_frames(span, &mut data).map_err(|(offset, fault)| {
            BinpackError::CorruptFrame {
                name: entry.name.clone(),
                offset,
                reason: fault.to_string(),
            }
        })?;
        if data.len() != entry.raw_len {
            return Err(BinpackError::LengthMismatch {
                name: entry.name,
                expected: entry.raw_len,
                actual: data.len(),
            });
        }
        let actual = md5_hex(&data);
        if !actual.eq_ignore_ascii_case(&entry.md5) {
            return Err(BinpackError::DigestMismatch {
                name: entry.name,
                expected: entry.md5,
                actual,
            });
        }
        info!("binpack: unpacked {} ({} bytes)", entry.name, data.len());
        files.push(PackedFile {
            address: entry.address,
            region: entry.region,
            name: entry.name,
            data,
        });
    }
    Ok(files)
}

impl Catalog {
    /// Header text without the trailing NUL.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(MAGIC);
        out.push('\n');
        if let Some(when) = self.when {
            out.push_str(&format!(
                "WHEN: {}\n",
                when.to_rfc3339_opts(SecondsFormat::Secs, true)
            ));
        }
        out.push_str(&format!("HOST: {}\n", self.host));
        out.push_str(&format!("SNAP: {}\n", self.snapshot));
        for e in &self.entries {
            out.push_str(&format!(
                "LOAD: {},0x{:08x},0x{:08x},{},{},{}\n",
                e.name, e.address, e.region, e.raw_len, e.compressed_len, e.md5
            ));
        }
        out.push_str(MAGIC);
        out.push('\n');
        out
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines().map(str::trim_end);
        if lines.next() != Some(MAGIC) {
            return Err(BinpackError::BadHeader("missing opening magic".into()));
        }

        let mut catalog = Catalog {
            when: None,
            host: String::new(),
            snapshot: String::new(),
            entries: Vec::new(),
        };
        let mut closed = false;
        for line in lines {
            if line == MAGIC {
                closed = true;
                break;
            }
            let Some((key, value)) = line.split_once(':') else {
                if line.is_empty() {
                    continue;
                }
                return Err(BinpackError::BadHeader(format!("unexpected line {:?}", line)));
            };
            let value = value.trim();
            match key {
                "WHEN" => {
                    let when = DateTime::parse_from_rfc3339(value).map_err(|e| {
                        BinpackError::BadHeader(format!("bad WHEN {:?}: {}", value, e))
                    })?;
                    catalog.when = Some(when.with_timezone(&Utc));
                }
                "HOST" => catalog.host = value.to_string(),
                "SNAP" => catalog.snapshot = value.to_string(),
                "LOAD" => catalog.entries.push(parse_load(value)?),
                // Unknown keys are reserved for newer packers.
                other => debug!("binpack: ignoring header key {}", other),
            }
        }
        if !closed {
            return Err(BinpackError::BadHeader("missing closing magic".into()));
        }
        Ok(catalog)
    }
}

fn parse_load(value: &str) -> Result<CatalogEntry> {
    let bad = |reason: &str| BinpackError::BadLoadLine {
        line: value.to_string(),
        reason: reason.to_string(),
    };
    let fields: Vec<&str> = value.split(',').map(str::trim).collect();
    let [name, address, region, raw_len, compressed_len, md5] = fields[..] else {
        return Err(bad("expected 6 fields"));
    };
    if md5.len() != 32 || !md5.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(bad("md5 must be 32 hex digits"));
    }
    Ok(CatalogEntry {
        name: name.to_string(),
        address: parse_number(address).ok_or_else(|| bad("bad address"))?,
        region: parse_number(region).ok_or_else(|| bad("bad region"))?,
        raw_len: raw_len
            .parse()
            .ok()
            .filter(|&len| len <= MAX_FILE_LEN)
            .ok_or_else(|| bad("bad length"))?,
        compressed_len: compressed_len
            .parse()
            .map_err(|_| bad("bad compressed length"))?,
        md5: md5.to_ascii_lowercase(),
    })
}

/// Parse `0x`-prefixed hex or plain decimal.
pub fn parse_number(s: &str) -> Option<u32> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

/// Lowercase hex MD5 of `data`.
pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", Md5::digest(data))
}

/// Names go on comma-separated LOAD lines.
/// Surrounding whitespace is dropped since the parser trims every field.
fn clean_name(name: &str) -> String {
    let kept: String = name
        .chars()
        .filter(|&c| c != ',' && c != '\n' && c != '\r' && c != '\0')
        .collect();
    kept.trim().to_string()
}

fn clean_value(value: &str) -> String {
    let kept: String = value
        .chars()
        .filter(|&c| c != '\n' && c != '\r' && c != '\0')
        .collect();
    kept.trim().to_string()
}
