//! Versioned key-value domain
//!
//! A domain keeps the latest value of every key plus enough history to read
//! any key as of a past transaction number. Writes are tagged with the
//! current txNum and buffered in the hot store; finished aggregation steps
//! are collated into immutable shard files, merged into wider shards and
//! pruned from the hot store.
//!
//! Shard kinds per `[start, end)` step range:
//!
//! - `.kv` / `.kvi`: latest value per key in the range, nil word = deleted
//! - `.v` / `.vi`: value before each change, keyed by `key ++ txNum`
//! - `.ef` / `.efi`: txNums at which each key changed
//!
//! One writer drives `set_tx_num`, `put`, `delete`, `rotate`, collation,
//! merge and prune. Any number of threads may read through
//! [`DomainContext`]s, which pin the shards they see.

mod buffer;
mod collate;
mod context;
mod files;
mod inverted_index;
mod iter;
mod merge;
mod prune;

pub use buffer::FlushBatch;
pub use collate::{Collation, ShardParts, StaticFiles};
pub use context::DomainContext;
pub use files::{
    build_index, file_name, parse_file_name, scan_state_files, FileKind, FileRange, FilesItem,
    PairCursor,
};
pub use inverted_index::{decode_tx_nums, encode_tx_nums, InvertedIndex};
pub use iter::DomainIter;
pub use merge::{DomainRanges, MergeRange, MergedFiles};

use crate::kv::{TableFlags, Tx};
use crate::seg::WordConfig;
use crate::{compose_key, Result, StrataError, TxNum, Value};
use buffer::WriteBuffer;
use files::{shard_path, FileSet};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Hot store table names used by a domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainTables {
    /// Dup-sorted: `key -> !step`
    pub keys: String,
    /// `key ++ !step -> tagged value`
    pub vals: String,
    /// Dup-sorted: `txNum -> key`
    pub history_keys: String,
    /// `key ++ txNum -> tagged previous value`
    pub history_vals: String,
    /// Dup-sorted: `key -> txNum`
    pub index: String,
}

impl DomainTables {
    /// Table names with their layout, for creating the hot store
    pub fn table_config(&self) -> Vec<(String, TableFlags)> {
        vec![
            (self.keys.clone(), TableFlags::DupSort),
            (self.vals.clone(), TableFlags::Default),
            (self.history_keys.clone(), TableFlags::DupSort),
            (self.history_vals.clone(), TableFlags::Default),
            (self.index.clone(), TableFlags::DupSort),
        ]
    }
}

impl Default for DomainTables {
    fn default() -> Self {
        Self {
            keys: "Keys".into(),
            vals: "Vals".into(),
            history_keys: "HistoryKeys".into(),
            history_vals: "HistoryVals".into(),
            index: "Index".into(),
        }
    }
}

/// Domain configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainConfig {
    /// Directory holding shard files
    pub dir: PathBuf,
    /// Transaction numbers per step
    pub aggregation_step: u64,
    /// Shard file name prefix
    pub filename_base: String,
    /// Hot store tables
    pub tables: DomainTables,
    /// Keep history and the inverted index
    pub with_history: bool,
    /// LZ4-compress long words in shard files
    pub compress_values: bool,
    /// Minimum word length worth compressing
    pub compress_min_len: usize,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data"),
            aggregation_step: crate::config::DEFAULT_AGGREGATION_STEP,
            filename_base: "domain".into(),
            tables: DomainTables::default(),
            with_history: true,
            compress_values: true,
            compress_min_len: crate::config::COMPRESS_MIN_LEN,
        }
    }
}

impl DomainConfig {
    /// Check the configuration for values the domain cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.aggregation_step == 0 {
            return Err(StrataError::Config("aggregation_step must be positive".into()));
        }
        if self.filename_base.is_empty() {
            return Err(StrataError::Config("filename_base must not be empty".into()));
        }
        Ok(())
    }

    pub(crate) fn word_config(&self) -> WordConfig {
        WordConfig {
            compress_min_len: self.compress_min_len,
            compression: self.compress_values,
        }
    }

    pub(crate) fn kinds(&self) -> &'static [FileKind] {
        if self.with_history {
            &[FileKind::Values, FileKind::History, FileKind::Index]
        } else {
            &[FileKind::Values]
        }
    }
}

/// Shard counts and sizes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DomainStats {
    pub tx_num: TxNum,
    pub buffered_rows: usize,
    pub buffered_bytes: usize,
    pub values_files: usize,
    pub values_bytes: u64,
    pub history_files: usize,
    pub history_bytes: u64,
    pub index_files: usize,
    pub index_bytes: u64,
}

/// A versioned key-value domain
pub struct Domain {
    config: Arc<DomainConfig>,
    tx_num: AtomicU64,
    buffer: RwLock<WriteBuffer>,
    values: RwLock<FileSet>,
    history: RwLock<FileSet>,
    index: RwLock<FileSet>,
}

impl Domain {
    /// Open a domain, registering the shard files found in its directory
    pub fn open(config: DomainConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.dir)?;

        let domain = Self {
            config: Arc::new(config),
            tx_num: AtomicU64::new(0),
            buffer: RwLock::new(WriteBuffer::new()),
            values: RwLock::new(FileSet::default()),
            history: RwLock::new(FileSet::default()),
            index: RwLock::new(FileSet::default()),
        };
        domain.open_folder()?;

        Ok(domain)
    }

    /// Domain configuration
    pub fn config(&self) -> &DomainConfig {
        &self.config
    }

    /// Transaction numbers per step
    pub fn aggregation_step(&self) -> u64 {
        self.config.aggregation_step
    }

    /// Transaction number used by subsequent writes
    pub fn tx_num(&self) -> TxNum {
        self.tx_num.load(Ordering::Acquire)
    }

    /// Set the transaction number for subsequent writes; it must not decrease
    pub fn set_tx_num(&self, tx_num: TxNum) -> Result<()> {
        let current = self.tx_num();
        if tx_num < current {
            return Err(StrataError::TxNumDecreased {
                current,
                requested: tx_num,
            });
        }
        self.tx_num.store(tx_num, Ordering::Release);
        Ok(())
    }

    /// Set `key ++ subkey` to `value`, reading the previous value through
    /// the buffer, the hot store and the shard files
    pub fn put<T: Tx + ?Sized>(&self, key: &[u8], subkey: &[u8], value: &[u8], tx: &T) -> Result<()> {
        let full = compose_key(key, subkey);
        let prev = self.read_latest(&full, tx)?;
        if prev.as_deref() == Some(value) {
            return Ok(());
        }
        self.write(full, Value::present(value), prev);
        Ok(())
    }

    /// Delete `key ++ subkey`; a no-op when the key holds no value
    pub fn delete<T: Tx + ?Sized>(&self, key: &[u8], subkey: &[u8], tx: &T) -> Result<()> {
        let full = compose_key(key, subkey);
        match self.read_latest(&full, tx)? {
            Some(prev) => {
                self.write(full, Value::Deleted, Some(prev));
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Set `key ++ subkey` to `value` with a caller-supplied previous value
    pub fn put_with_prev(&self, key: &[u8], subkey: &[u8], value: &[u8], prev: Option<&[u8]>) -> Result<()> {
        self.write(compose_key(key, subkey), Value::present(value), prev.map(<[u8]>::to_vec));
        Ok(())
    }

    /// Delete `key ++ subkey` with a caller-supplied previous value
    pub fn delete_with_prev(&self, key: &[u8], subkey: &[u8], prev: Option<&[u8]>) -> Result<()> {
        self.write(compose_key(key, subkey), Value::Deleted, prev.map(<[u8]>::to_vec));
        Ok(())
    }

    /// Swap out the write buffer for flushing
    pub fn rotate(&self) -> FlushBatch {
        let buffer = std::mem::replace(&mut *self.buffer.write(), WriteBuffer::new());
        FlushBatch::new(buffer, Arc::clone(&self.config))
    }

    /// Check if the write buffer holds writes not yet rotated out
    pub fn has_unflushed_writes(&self) -> bool {
        !self.buffer.read().is_empty()
    }

    /// Pin the current shards into a read view
    pub fn make_context(&self) -> DomainContext {
        let values = self.values.read();
        let history = self.history.read();
        let index = self.index.read();
        DomainContext::new(
            Arc::clone(&self.config),
            values.visible(),
            history.visible(),
            index.visible(),
        )
    }

    /// Check if the hot store holds no rows of this domain
    pub fn is_empty<T: Tx + ?Sized>(&self, tx: &T) -> Result<bool> {
        let tables = &self.config.tables;
        if tx.range(&tables.keys, &[], None)?.next().is_some() {
            return Ok(false);
        }
        if self.config.with_history && tx.range(&tables.history_keys, &[], None)?.next().is_some() {
            return Ok(false);
        }
        Ok(true)
    }

    /// Smallest end among the file sets in use: no merge may reach past it
    pub fn end_tx_num_minimax(&self) -> TxNum {
        let mut min = self.values.read().end_tx_num();
        if self.config.with_history {
            min = min.min(self.history.read().end_tx_num());
            min = min.min(self.index.read().end_tx_num());
        }
        min
    }

    /// Shard counts and sizes
    pub fn stats(&self) -> DomainStats {
        let buffer = self.buffer.read();
        let values = self.values.read();
        let history = self.history.read();
        let index = self.index.read();
        DomainStats {
            tx_num: self.tx_num(),
            buffered_rows: buffer.len(),
            buffered_bytes: buffer.size(),
            values_files: values.len(),
            values_bytes: values.size(),
            history_files: history.len(),
            history_bytes: history.size(),
            index_files: index.len(),
            index_bytes: index.size(),
        }
    }

    /// Registered shards of one kind, ascending by `(end, start)`
    pub fn files(&self, kind: FileKind) -> Vec<Arc<FilesItem>> {
        self.file_set(kind).read().items().cloned().collect()
    }

    /// Unregister every shard, leaving the files on disk
    pub fn close_files(&self) {
        self.values.write().clear();
        self.history.write().clear();
        self.index.write().clear();
    }

    /// Rebuild the file sets from the shard files in the directory
    pub fn open_folder(&self) -> Result<()> {
        let dir = &self.config.dir;
        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".tmp") {
                info!("Removing leftover temporary file {}", name);
                std::fs::remove_file(entry.path())?;
                continue;
            }
            names.push(name);
        }

        let base = &self.config.filename_base;
        let step = self.config.aggregation_step;
        for &kind in self.config.kinds() {
            let ranges = scan_state_files(&names, base, kind);
            self.build_missed_indices(kind, &ranges)?;

            let mut set = self.file_set(kind).write();
            set.clear();
            for range in ranges {
                let data = shard_path(dir, base, range.start_step, range.end_step, kind.data_ext());
                let idx = shard_path(dir, base, range.start_step, range.end_step, kind.index_ext());
                match FilesItem::open(&data, &idx, range.start_step * step, range.end_step * step) {
                    Ok(item) => set.insert(Arc::new(item)),
                    Err(e) => warn!("Skipping {:?}: {}", data, e),
                }
            }
            info!("Opened {} {} files for {}", set.len(), kind, base);
        }

        Ok(())
    }

    /// Rebuild index files missing next to their data files
    pub fn build_missed_indices(&self, kind: FileKind, ranges: &[FileRange]) -> Result<()> {
        let dir = &self.config.dir;
        let base = &self.config.filename_base;
        for range in ranges {
            let data = shard_path(dir, base, range.start_step, range.end_step, kind.data_ext());
            let idx = shard_path(dir, base, range.start_step, range.end_step, kind.index_ext());
            if data.exists() && !idx.exists() {
                info!("Building missing index {:?}", idx);
                build_index(&data, &idx)?;
            }
        }
        Ok(())
    }

    fn file_set(&self, kind: FileKind) -> &RwLock<FileSet> {
        match kind {
            FileKind::Values => &self.values,
            FileKind::History => &self.history,
            FileKind::Index => &self.index,
        }
    }

    fn read_latest<T: Tx + ?Sized>(&self, key: &[u8], tx: &T) -> Result<Option<Vec<u8>>> {
        if let Some(value) = self.buffer.read().latest(key) {
            return Ok(value.into_bytes());
        }
        self.make_context().get_latest_full(key, tx)
    }

    fn write(&self, key: Vec<u8>, value: Value, prev: Option<Vec<u8>>) {
        let tx_num = self.tx_num();
        let step = tx_num / self.config.aggregation_step;
        let prev = self
            .config
            .with_history
            .then(|| prev.map_or(Value::Deleted, Value::Present));
        self.buffer.read().put(key, step, tx_num, value, prev);
    }
}
