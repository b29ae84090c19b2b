//! Perfect-hash index reader

use super::{Cascade, FORMAT_VERSION, MAGIC};
use crate::{Result, StrataError};
use bytes::Buf;
use std::path::{Path, PathBuf};

/// An opened perfect-hash index
#[derive(Debug)]
pub struct Index {
    path: PathBuf,
    key_count: u64,
    cascade: Cascade,
    offsets: Vec<u64>,
    size: u64,
}

impl Index {
    /// Open and verify an index file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = std::fs::read(&path)?;
        if data.len() < 32 {
            return Err(StrataError::InvalidFormat(format!(
                "Index {:?} too short: {} bytes",
                path,
                data.len()
            )));
        }

        let (body, trailer) = data.split_at(data.len() - 4);
        let expected = (&trailer[..]).get_u32_le();
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(StrataError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = body;
        if &cursor[..4] != MAGIC {
            return Err(StrataError::InvalidFormat("Invalid index magic".into()));
        }
        cursor.advance(4);
        let version = cursor.get_u32_le();
        if version != FORMAT_VERSION {
            return Err(StrataError::InvalidFormat(format!(
                "Unsupported version: {}",
                version
            )));
        }
        let key_count = cursor.get_u64_le();
        let seed = cursor.get_u64_le();
        let level_count = cursor.get_u32_le() as usize;

        let mut levels = Vec::with_capacity(level_count);
        for _ in 0..level_count {
            ensure_remaining(&cursor, 4)?;
            let words = cursor.get_u32_le() as usize;
            ensure_remaining(&cursor, words * 8)?;
            levels.push((0..words).map(|_| cursor.get_u64_le()).collect::<Vec<_>>());
        }

        ensure_remaining(&cursor, key_count as usize * 8)?;
        let offsets: Vec<u64> = (0..key_count).map(|_| cursor.get_u64_le()).collect();
        if cursor.has_remaining() {
            return Err(StrataError::InvalidFormat(format!(
                "Index {:?} has {} trailing bytes",
                path,
                cursor.remaining()
            )));
        }

        Ok(Self {
            path,
            key_count,
            cascade: Cascade::new(seed, levels),
            offsets,
            size: data.len() as u64,
        })
    }

    /// Offset stored for `key`; arbitrary when `key` was not in the build set
    pub fn lookup(&self, key: &[u8]) -> u64 {
        self.cascade
            .slot(key)
            .and_then(|slot| self.offsets.get(slot as usize).copied())
            .unwrap_or(0)
    }

    /// Number of keys the index was built over
    pub fn key_count(&self) -> u64 {
        self.key_count
    }

    /// File path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }
}

fn ensure_remaining(cursor: &&[u8], n: usize) -> Result<()> {
    if cursor.remaining() < n {
        return Err(StrataError::InvalidFormat("Truncated index".into()));
    }
    Ok(())
}
