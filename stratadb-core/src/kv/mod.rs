//! Hot store interface
//!
//! The domain buffers not-yet-collated rows in an external transactional
//! key-value store. This module fixes the contract the domain needs from that
//! store:
//!
//! - Ordered tables addressed by name
//! - Duplicate-sorted tables holding several sorted values per key
//! - Snapshot-isolated reads within one transaction
//!
//! [`MemDb`] is an in-memory implementation of the contract.

mod mem;

pub use mem::{MemDb, MemRwTx, MemTx};

use crate::Result;

/// Boxed row iterator returned by [`Tx::range`]
pub type KvIter<'a> = Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> + 'a>;

/// Table layout flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFlags {
    /// One value per key, `put` replaces
    Default,
    /// Several values per key, kept sorted, `put` adds
    DupSort,
}

/// Read-only transaction
pub trait Tx {
    /// First value stored under `key` (the smallest duplicate for dup-sorted tables)
    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// First duplicate of `key` that is `>= from`
    fn seek_dup(&self, table: &str, key: &[u8], from: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Rows with `from <= key < to` in `(key, value)` order
    fn range<'a>(&'a self, table: &str, from: &[u8], to: Option<&[u8]>) -> Result<KvIter<'a>>;

    /// All duplicates of `key` in ascending order
    fn get_dups(&self, table: &str, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        let next = prefix_successor(key);
        self.range(table, key, next.as_deref())?
            .filter_map(|row| match row {
                Ok((k, v)) if k == key => Some(Ok(v)),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            })
            .collect()
    }
}

/// Read-write transaction
pub trait RwTx: Tx {
    /// Store a row; replaces for default tables, adds a duplicate for dup-sorted ones
    fn put(&mut self, table: &str, key: &[u8], value: &[u8]) -> Result<()>;

    /// Delete one duplicate of `key`, or every value of `key` when `value` is `None`
    fn delete(&mut self, table: &str, key: &[u8], value: Option<&[u8]>) -> Result<()>;
}

/// Smallest key greater than every key starting with `prefix`, if one exists
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut next = prefix.to_vec();
    while let Some(last) = next.pop() {
        if last < 0xff {
            next.push(last + 1);
            return Some(next);
        }
    }
    None
}
