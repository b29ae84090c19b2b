//! Word file writer

use super::{put_uvarint, WordConfig, FORMAT_VERSION, MAGIC};
use crate::Result;
use bytes::{BufMut, BytesMut};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Writes a word file to `<path>.tmp`, renaming it into place on
/// [`WordWriter::finish`]. Dropping an unfinished writer leaves only the
/// temporary file behind.
pub struct WordWriter {
    config: WordConfig,
    path: PathBuf,
    tmp_path: PathBuf,
    file: BufWriter<File>,
    hasher: crc32fast::Hasher,
    offset: u64,
    word_count: u64,
    scratch: Vec<u8>,
}

impl WordWriter {
    /// Create a new word file writer
    pub fn create(path: impl AsRef<Path>, config: WordConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let tmp_path = tmp_path(&path);
        let file = BufWriter::new(File::create(&tmp_path)?);

        let mut writer = Self {
            config,
            path,
            tmp_path,
            file,
            hasher: crc32fast::Hasher::new(),
            offset: 0,
            word_count: 0,
            scratch: Vec::new(),
        };

        let mut header = BytesMut::with_capacity(super::HEADER_SIZE);
        header.put_slice(MAGIC);
        header.put_u32_le(FORMAT_VERSION);
        writer.write_raw(&header)?;

        Ok(writer)
    }

    /// Append a word, returning the byte offset it starts at
    pub fn add_word(&mut self, word: &[u8]) -> Result<u64> {
        let offset = self.offset;

        let compressed = if self.config.compression && word.len() >= self.config.compress_min_len {
            let packed = lz4_flex::compress_prepend_size(word);
            (packed.len() < word.len()).then_some(packed)
        } else {
            None
        };

        self.scratch.clear();
        match compressed {
            Some(packed) => {
                put_uvarint(&mut self.scratch, (((packed.len() as u64) << 1) | 1) + 1);
                self.scratch.extend_from_slice(&packed);
            }
            None => {
                put_uvarint(&mut self.scratch, ((word.len() as u64) << 1) + 1);
                self.scratch.extend_from_slice(word);
            }
        }
        let buf = std::mem::take(&mut self.scratch);
        self.write_raw(&buf)?;
        self.scratch = buf;

        self.word_count += 1;
        Ok(offset)
    }

    /// Append a nil word (distinct from an empty word)
    pub fn add_nil_word(&mut self) -> Result<u64> {
        let offset = self.offset;
        self.write_raw(&[0])?;
        self.word_count += 1;
        Ok(offset)
    }

    /// Append `Some(word)` as a word and `None` as a nil word
    pub fn add_optional(&mut self, word: Option<&[u8]>) -> Result<u64> {
        match word {
            Some(w) => self.add_word(w),
            None => self.add_nil_word(),
        }
    }

    /// Number of words written so far
    pub fn word_count(&self) -> u64 {
        self.word_count
    }

    /// Final path of the file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the footer, sync and move the file into place
    pub fn finish(mut self) -> Result<PathBuf> {
        let mut footer = BytesMut::with_capacity(super::FOOTER_SIZE);
        footer.put_u64_le(self.word_count);
        footer.put_u32_le(self.hasher.clone().finalize());
        footer.put_slice(MAGIC);
        self.file.write_all(&footer)?;

        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        fs::rename(&self.tmp_path, &self.path)?;

        Ok(self.path)
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data)?;
        self.hasher.update(data);
        self.offset += data.len() as u64;
        Ok(())
    }
}

/// Temporary name a file is written under before it is renamed into place
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}
