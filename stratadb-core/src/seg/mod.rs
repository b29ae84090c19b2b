//! Compressed word files
//!
//! A word file is a flat sequence of byte strings ("words") readable forward
//! or from any word boundary whose byte offset is known (the perfect-hash
//! indexes store those offsets). Layout:
//!
//! - Header: magic `SWRD`, format version
//! - Words: varint header (`0` = nil word, otherwise `(len << 1 | lz4) + 1`)
//!   followed by the payload, LZ4-compressed when that is smaller
//! - Footer: word count, CRC32 of everything before the footer, magic
//!
//! Nil words are distinct from empty words; shard files use them for
//! tombstones.

mod reader;
mod writer;

pub use reader::{Decompressor, Getter};
pub use writer::{tmp_path, WordWriter};

use crate::{Result, StrataError};

/// Word file format version
pub const FORMAT_VERSION: u32 = 1;

pub(crate) const MAGIC: &[u8; 4] = b"SWRD";
pub(crate) const HEADER_SIZE: usize = 8;
pub(crate) const FOOTER_SIZE: usize = 16;

/// Word file configuration
#[derive(Debug, Clone, Copy)]
pub struct WordConfig {
    /// Try LZ4 on words at least this long
    pub compress_min_len: usize,
    /// Enable LZ4
    pub compression: bool,
}

impl Default for WordConfig {
    fn default() -> Self {
        Self {
            compress_min_len: crate::config::COMPRESS_MIN_LEN,
            compression: true,
        }
    }
}

/// Append an unsigned LEB128 varint
pub fn put_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

/// Read an unsigned LEB128 varint, returning the value and bytes consumed
pub fn get_uvarint(data: &[u8]) -> Result<(u64, usize)> {
    let mut v = 0u64;
    for (i, &b) in data.iter().enumerate().take(10) {
        v |= u64::from(b & 0x7f) << (7 * i);
        if b & 0x80 == 0 {
            return Ok((v, i + 1));
        }
    }
    Err(StrataError::InvalidFormat("Truncated varint".into()))
}
