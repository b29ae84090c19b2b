//! Word file reader

use super::{get_uvarint, FOOTER_SIZE, FORMAT_VERSION, HEADER_SIZE, MAGIC};
use crate::{Result, StrataError};
use bytes::{Buf, Bytes};
use std::path::{Path, PathBuf};

/// An opened, checksum-verified word file
#[derive(Debug)]
pub struct Decompressor {
    path: PathBuf,
    data: Bytes,
    words_end: usize,
    word_count: u64,
}

impl Decompressor {
    /// Open a word file and verify its header, footer and checksum
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = Bytes::from(std::fs::read(&path)?);

        if data.len() < HEADER_SIZE + FOOTER_SIZE {
            return Err(StrataError::InvalidFormat(format!(
                "Word file {:?} too short: {} bytes",
                path,
                data.len()
            )));
        }

        let mut header = &data[..HEADER_SIZE];
        if &header[..4] != MAGIC {
            return Err(StrataError::InvalidFormat("Invalid word file header".into()));
        }
        header.advance(4);
        let version = header.get_u32_le();
        if version != FORMAT_VERSION {
            return Err(StrataError::InvalidFormat(format!(
                "Unsupported version: {}",
                version
            )));
        }

        let words_end = data.len() - FOOTER_SIZE;
        let mut footer = &data[words_end..];
        let word_count = footer.get_u64_le();
        let expected = footer.get_u32_le();
        if footer != MAGIC {
            return Err(StrataError::InvalidFormat("Invalid word file magic".into()));
        }

        let actual = crc32fast::hash(&data[..words_end]);
        if expected != actual {
            return Err(StrataError::ChecksumMismatch { expected, actual });
        }

        Ok(Self {
            path,
            data,
            words_end,
            word_count,
        })
    }

    /// File path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of words in the file
    pub fn word_count(&self) -> u64 {
        self.word_count
    }

    /// File size in bytes
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Create a cursor positioned at the first word
    pub fn make_getter(&self) -> Getter {
        Getter {
            data: self.data.clone(),
            pos: HEADER_SIZE,
            end: self.words_end,
        }
    }
}

/// Forward cursor over a word file
#[derive(Clone)]
pub struct Getter {
    data: Bytes,
    pos: usize,
    end: usize,
}

impl Getter {
    /// Check if another word follows
    pub fn has_next(&self) -> bool {
        self.pos < self.end
    }

    /// Move to a word boundary; offset `0` means the first word
    pub fn reset(&mut self, offset: u64) {
        self.pos = (offset as usize).max(HEADER_SIZE);
    }

    /// Byte offset of the next word
    pub fn offset(&self) -> u64 {
        self.pos as u64
    }

    /// Read the next word; `None` is a nil word
    pub fn next(&mut self) -> Result<Option<Vec<u8>>> {
        match self.next_raw()? {
            Some((payload, false)) => Ok(Some(payload.to_vec())),
            Some((payload, true)) => lz4_flex::decompress_size_prepended(&payload)
                .map(Some)
                .map_err(|e| StrataError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    /// Read the next word, treating a nil word as corruption
    pub fn next_key(&mut self) -> Result<Vec<u8>> {
        self.next()?.ok_or_else(|| {
            StrataError::Corruption(format!("Nil word where a key was expected at {}", self.pos))
        })
    }

    /// Step over the next word without decoding it
    pub fn skip(&mut self) -> Result<()> {
        self.next_raw().map(|_| ())
    }

    fn next_raw(&mut self) -> Result<Option<(Bytes, bool)>> {
        if self.pos >= self.end {
            return Err(StrataError::Corruption(format!(
                "Read past the last word at offset {}",
                self.pos
            )));
        }
        let (header, n) = get_uvarint(&self.data[self.pos..self.end])?;
        self.pos += n;
        if header == 0 {
            return Ok(None);
        }

        let header = header - 1;
        let compressed = header & 1 == 1;
        let len = (header >> 1) as usize;
        if self.pos + len > self.end {
            return Err(StrataError::Corruption(format!(
                "Word of {} bytes at offset {} overruns the file",
                len, self.pos
            )));
        }

        let payload = self.data.slice(self.pos..self.pos + len);
        self.pos += len;
        Ok(Some((payload, compressed)))
    }
}
