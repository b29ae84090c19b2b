//! Static minimal-perfect-hash index
//!
//! Built once over an exact, duplicate-free key set, the index maps every key
//! of the set to a `u64` (a byte offset into the companion word file).
//! Looking up a key outside the set returns an arbitrary offset: the index is
//! not a membership filter, callers compare the key stored at the offset.
//!
//! The hash is a cascade of bit levels. Each level hashes the keys still
//! unplaced into a bit array about twice their count; keys landing on a
//! unique bit are placed there, colliding keys fall through to the next
//! level. A key's slot is the rank of its bit across all levels, which
//! addresses a dense offsets table.

mod builder;
mod index;

pub use builder::IndexBuilder;
pub use index::Index;

/// Index file format version
pub const FORMAT_VERSION: u32 = 1;

pub(crate) const MAGIC: &[u8; 4] = b"SIDX";

/// Bits per key at each level
pub(crate) const GAMMA: f64 = 2.0;

/// Levels tried before the build restarts with another seed
pub(crate) const MAX_LEVELS: usize = 48;

/// Seeds tried before the build gives up
pub(crate) const MAX_SEED_ATTEMPTS: u64 = 8;

/// Stable seeded 64-bit hash of `key` for cascade `level`
pub(crate) fn hash_key(seed: u64, level: u32, key: &[u8]) -> u64 {
    let mut h = mix(seed ^ u64::from(level).wrapping_mul(0x9e37_79b9_7f4a_7c15))
        ^ (key.len() as u64).wrapping_mul(0xff51_afd7_ed55_8ccd);
    for chunk in key.chunks(8) {
        let mut word = [0u8; 8];
        word[..chunk.len()].copy_from_slice(chunk);
        h = mix(h ^ u64::from_le_bytes(word));
    }
    mix(h)
}

/// splitmix64 finalizer; a bijection on `u64`
fn mix(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Bit array size (in 64-bit words) for a level holding `keys` keys
pub(crate) fn level_words(keys: usize) -> usize {
    let bits = ((keys as f64) * GAMMA).ceil() as usize;
    bits.div_ceil(64).max(1)
}

/// Placed bit levels plus the rank tables needed to turn a bit into a slot
#[derive(Debug)]
pub(crate) struct Cascade {
    pub(crate) seed: u64,
    pub(crate) levels: Vec<Vec<u64>>,
    /// Set bits before each level
    level_base: Vec<u64>,
    /// Set bits before each word, per level
    word_rank: Vec<Vec<u64>>,
}

impl Cascade {
    pub(crate) fn new(seed: u64, levels: Vec<Vec<u64>>) -> Self {
        let mut level_base = Vec::with_capacity(levels.len());
        let mut word_rank = Vec::with_capacity(levels.len());
        let mut total = 0u64;
        for level in &levels {
            level_base.push(total);
            let mut ranks = Vec::with_capacity(level.len());
            let mut within = 0u64;
            for word in level {
                ranks.push(within);
                within += u64::from(word.count_ones());
            }
            word_rank.push(ranks);
            total += within;
        }
        Self {
            seed,
            levels,
            level_base,
            word_rank,
        }
    }

    /// Walk the cascade for `key`; `None` if no level claims it
    pub(crate) fn slot(&self, key: &[u8]) -> Option<u64> {
        for (level, words) in self.levels.iter().enumerate() {
            let bits = (words.len() * 64) as u64;
            let bit = (hash_key(self.seed, level as u32, key) % bits) as usize;
            let word = words[bit / 64];
            let mask = 1u64 << (bit % 64);
            if word & mask != 0 {
                let within = u64::from((word & (mask - 1)).count_ones());
                return Some(self.level_base[level] + self.word_rank[level][bit / 64] + within);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable_and_seeded() {
        assert_eq!(hash_key(1, 0, b"key1"), hash_key(1, 0, b"key1"));
        assert_ne!(hash_key(1, 0, b"key1"), hash_key(2, 0, b"key1"));
        assert_ne!(hash_key(1, 0, b"key1"), hash_key(1, 1, b"key1"));
        // trailing zero padding must not alias
        assert_ne!(hash_key(1, 0, b"a"), hash_key(1, 0, b"a\0"));
    }
}
