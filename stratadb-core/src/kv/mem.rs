//! In-memory hot store with snapshot isolation

use super::{KvIter, RwTx, TableFlags, Tx};
use crate::{Result, StrataError};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct Table {
    flags: TableFlags,
    rows: BTreeSet<(Vec<u8>, Vec<u8>)>,
}

type Tables = HashMap<String, Table>;

/// In-memory database: readers share an immutable snapshot, a read-write
/// transaction works on a private copy that replaces the snapshot on commit.
pub struct MemDb {
    tables: RwLock<Arc<Tables>>,
}

impl MemDb {
    /// Create a database with the given tables
    pub fn new<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = (S, TableFlags)>,
        S: Into<String>,
    {
        let tables = tables
            .into_iter()
            .map(|(name, flags)| {
                (
                    name.into(),
                    Table {
                        flags,
                        rows: BTreeSet::new(),
                    },
                )
            })
            .collect();
        Self {
            tables: RwLock::new(Arc::new(tables)),
        }
    }

    /// Begin a read-only transaction over the latest committed snapshot
    pub fn begin_ro(&self) -> MemTx {
        MemTx {
            tables: self.tables.read().clone(),
        }
    }

    /// Begin a read-write transaction
    pub fn begin_rw(&self) -> MemRwTx<'_> {
        let tables = Tables::clone(&self.tables.read());
        MemRwTx { db: self, tables }
    }

    /// Total number of rows across all tables
    pub fn row_count(&self) -> usize {
        self.tables.read().values().map(|t| t.rows.len()).sum()
    }
}

/// Read-only transaction
pub struct MemTx {
    tables: Arc<Tables>,
}

/// Read-write transaction; dropped without [`MemRwTx::commit`] it rolls back
pub struct MemRwTx<'db> {
    db: &'db MemDb,
    tables: Tables,
}

impl MemRwTx<'_> {
    /// Publish every change made in this transaction
    pub fn commit(self) {
        *self.db.tables.write() = Arc::new(self.tables);
    }

    /// Discard every change made in this transaction
    pub fn rollback(self) {}
}

fn table<'t>(tables: &'t Tables, name: &str) -> Result<&'t Table> {
    tables
        .get(name)
        .ok_or_else(|| StrataError::Config(format!("Unknown table: {}", name)))
}

fn get(tables: &Tables, name: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
    let t = table(tables, name)?;
    Ok(t
        .rows
        .range((key.to_vec(), Vec::new())..)
        .next()
        .filter(|(k, _)| k == key)
        .map(|(_, v)| v.clone()))
}

fn seek_dup(tables: &Tables, name: &str, key: &[u8], from: &[u8]) -> Result<Option<Vec<u8>>> {
    let t = table(tables, name)?;
    Ok(t
        .rows
        .range((key.to_vec(), from.to_vec())..)
        .next()
        .filter(|(k, _)| k == key)
        .map(|(_, v)| v.clone()))
}

fn range<'a>(tables: &'a Tables, name: &str, from: &[u8], to: Option<&[u8]>) -> Result<KvIter<'a>> {
    let t = table(tables, name)?;
    let to = to.map(|t| t.to_vec());
    let iter = t
        .rows
        .range((Bound::Included((from.to_vec(), Vec::new())), Bound::Unbounded))
        .take_while(move |(k, _)| to.as_ref().map_or(true, |to| k < to))
        .map(|(k, v)| Ok((k.clone(), v.clone())));
    Ok(Box::new(iter))
}

impl Tx for MemTx {
    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        get(&self.tables, table, key)
    }

    fn seek_dup(&self, table: &str, key: &[u8], from: &[u8]) -> Result<Option<Vec<u8>>> {
        seek_dup(&self.tables, table, key, from)
    }

    fn range<'a>(&'a self, table: &str, from: &[u8], to: Option<&[u8]>) -> Result<KvIter<'a>> {
        range(&self.tables, table, from, to)
    }
}

impl Tx for MemRwTx<'_> {
    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        get(&self.tables, table, key)
    }

    fn seek_dup(&self, table: &str, key: &[u8], from: &[u8]) -> Result<Option<Vec<u8>>> {
        seek_dup(&self.tables, table, key, from)
    }

    fn range<'a>(&'a self, table: &str, from: &[u8], to: Option<&[u8]>) -> Result<KvIter<'a>> {
        range(&self.tables, table, from, to)
    }
}

impl RwTx for MemRwTx<'_> {
    fn put(&mut self, name: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let t = self
            .tables
            .get_mut(name)
            .ok_or_else(|| StrataError::Config(format!("Unknown table: {}", name)))?;
        if t.flags == TableFlags::Default {
            remove_key(t, key);
        }
        t.rows.insert((key.to_vec(), value.to_vec()));
        Ok(())
    }

    fn delete(&mut self, name: &str, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        let t = self
            .tables
            .get_mut(name)
            .ok_or_else(|| StrataError::Config(format!("Unknown table: {}", name)))?;
        match value {
            Some(v) => {
                t.rows.remove(&(key.to_vec(), v.to_vec()));
            }
            None => remove_key(t, key),
        }
        Ok(())
    }
}

fn remove_key(t: &mut Table, key: &[u8]) {
    let doomed: Vec<_> = t
        .rows
        .range((key.to_vec(), Vec::new())..)
        .take_while(|(k, _)| k == key)
        .cloned()
        .collect();
    for row in doomed {
        t.rows.remove(&row);
    }
}
