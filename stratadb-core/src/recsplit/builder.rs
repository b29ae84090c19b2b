//! Perfect-hash index builder

use super::{hash_key, level_words, Cascade, FORMAT_VERSION, MAGIC, MAX_LEVELS, MAX_SEED_ATTEMPTS};
use crate::seg::tmp_path;
use crate::{Result, StrataError};
use bytes::{BufMut, BytesMut};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::debug;

const BASE_SEED: u64 = 0x5eed_0f5a_17ed_c0de;

/// Collects `(key, offset)` pairs and writes the index file
pub struct IndexBuilder {
    keys: Vec<Vec<u8>>,
    offsets: Vec<u64>,
    base_seed: u64,
}

impl IndexBuilder {
    /// Create a builder expecting about `key_count` keys
    pub fn new(key_count: usize) -> Self {
        Self {
            keys: Vec::with_capacity(key_count),
            offsets: Vec::with_capacity(key_count),
            base_seed: BASE_SEED,
        }
    }

    /// Add a key and the offset it maps to
    pub fn add_key(&mut self, key: &[u8], offset: u64) {
        self.keys.push(key.to_vec());
        self.offsets.push(offset);
    }

    /// Number of keys added
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Build the hash and write the index to `path` (via a temporary file)
    pub fn build(self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let mut seen = HashSet::with_capacity(self.keys.len());
        for key in &self.keys {
            if !seen.insert(key.as_slice()) {
                return Err(StrataError::IndexBuild(format!(
                    "Duplicate key {:?} for {:?}",
                    String::from_utf8_lossy(key),
                    path
                )));
            }
        }

        let mut attempt = 0;
        let (seed, levels) = loop {
            let seed = self.base_seed.wrapping_add(attempt);
            if let Some(levels) = self.place(seed) {
                break (seed, levels);
            }
            attempt += 1;
            if attempt >= MAX_SEED_ATTEMPTS {
                return Err(StrataError::IndexBuild(format!(
                    "Could not place {} keys after {} seeds",
                    self.keys.len(),
                    attempt
                )));
            }
            debug!("Index build for {:?} retrying with a new seed", path);
        };

        let cascade = Cascade::new(seed, levels);
        let mut slots = vec![0u64; self.keys.len()];
        for (key, offset) in self.keys.iter().zip(&self.offsets) {
            let slot = cascade.slot(key).ok_or_else(|| {
                StrataError::IndexBuild("Placed key not found in its own cascade".into())
            })?;
            slots[slot as usize] = *offset;
        }
        let levels = cascade.levels;

        let mut buf = BytesMut::new();
        buf.put_slice(MAGIC);
        buf.put_u32_le(FORMAT_VERSION);
        buf.put_u64_le(self.keys.len() as u64);
        buf.put_u64_le(seed);
        buf.put_u32_le(levels.len() as u32);
        for level in &levels {
            buf.put_u32_le(level.len() as u32);
            for word in level {
                buf.put_u64_le(*word);
            }
        }
        for offset in &slots {
            buf.put_u64_le(*offset);
        }
        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);

        let tmp = tmp_path(path);
        let mut file = BufWriter::new(File::create(&tmp)?);
        file.write_all(&buf)?;
        file.flush()?;
        file.get_ref().sync_all()?;
        fs::rename(&tmp, path)?;

        debug!(
            "Built index {:?}: {} keys, {} levels",
            path,
            self.keys.len(),
            levels.len()
        );
        Ok(())
    }

    /// Run the cascade for one seed; `None` if keys remain after the last level
    fn place(&self, seed: u64) -> Option<Vec<Vec<u64>>> {
        let mut remaining: Vec<usize> = (0..self.keys.len()).collect();
        let mut levels = Vec::new();

        while !remaining.is_empty() {
            if levels.len() >= MAX_LEVELS {
                return None;
            }
            let level = levels.len() as u32;
            let words = level_words(remaining.len());
            let bits = (words * 64) as u64;

            let mut taken = vec![0u64; words];
            let mut collided = vec![0u64; words];
            for &i in &remaining {
                let bit = (hash_key(seed, level, &self.keys[i]) % bits) as usize;
                let mask = 1u64 << (bit % 64);
                if taken[bit / 64] & mask != 0 {
                    collided[bit / 64] |= mask;
                } else {
                    taken[bit / 64] |= mask;
                }
            }

            let mut next = Vec::new();
            for &i in &remaining {
                let bit = (hash_key(seed, level, &self.keys[i]) % bits) as usize;
                if collided[bit / 64] & (1u64 << (bit % 64)) != 0 {
                    next.push(i);
                }
            }
            for (t, c) in taken.iter_mut().zip(&collided) {
                *t &= !c;
            }

            levels.push(taken);
            remaining = next;
        }

        Some(levels)
    }
}
