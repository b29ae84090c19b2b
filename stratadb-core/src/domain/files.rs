//! Shard files and the ordered sets that hold them
//!
//! Every shard file pairs a word file of `(key, payload)` words with a
//! perfect-hash index from key to the key word's offset. A file set is
//! ordered by `(end_tx_num, start_tx_num)`; its visible list drops shards
//! strictly covered by a wider registered shard, leaving disjoint ranges.

use crate::recsplit::{Index, IndexBuilder};
use crate::seg::{Decompressor, Getter};
use crate::{Result, Step, TxNum, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// The three kinds of shard files a domain keeps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    /// Latest value per key: `.kv` / `.kvi`
    Values,
    /// Previous value per `(key, txNum)`: `.v` / `.vi`
    History,
    /// Change txNums per key: `.ef` / `.efi`
    Index,
}

impl FileKind {
    /// Extension of the word file
    pub fn data_ext(self) -> &'static str {
        match self {
            FileKind::Values => "kv",
            FileKind::History => "v",
            FileKind::Index => "ef",
        }
    }

    /// Extension of the perfect-hash index file
    pub fn index_ext(self) -> &'static str {
        match self {
            FileKind::Values => "kvi",
            FileKind::History => "vi",
            FileKind::Index => "efi",
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileKind::Values => write!(f, "values"),
            FileKind::History => write!(f, "history"),
            FileKind::Index => write!(f, "index"),
        }
    }
}

/// Step range encoded in a shard file name
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileRange {
    pub start_step: Step,
    pub end_step: Step,
}

/// `<base>.<start>-<end>.<ext>`
pub fn file_name(base: &str, start_step: Step, end_step: Step, ext: &str) -> String {
    format!("{}.{}-{}.{}", base, start_step, end_step, ext)
}

/// Parse `<base>.<start>-<end>.<ext>`; `None` for foreign or malformed names
pub fn parse_file_name(name: &str, base: &str, ext: &str) -> Option<FileRange> {
    let rest = name.strip_prefix(base)?.strip_prefix('.')?;
    let range = rest.strip_suffix(ext)?.strip_suffix('.')?;
    let (start, end) = range.split_once('-')?;
    let start_step = start.parse().ok()?;
    let end_step = end.parse().ok()?;
    (start_step < end_step).then_some(FileRange {
        start_step,
        end_step,
    })
}

/// Ranges of all `kind` data files among `names`, ascending and deduplicated
pub fn scan_state_files<S: AsRef<str>>(names: &[S], base: &str, kind: FileKind) -> Vec<FileRange> {
    let suffix = format!(".{}", kind.data_ext());
    let mut ranges: Vec<FileRange> = names
        .iter()
        .map(AsRef::as_ref)
        .filter(|name| name.starts_with(base) && name.ends_with(&suffix))
        .filter_map(|name| {
            let range = parse_file_name(name, base, kind.data_ext());
            if range.is_none() {
                warn!("Skipping file with unparsable range: {}", name);
            }
            range
        })
        .collect();
    ranges.sort_by_key(|r| (r.end_step, r.start_step));
    ranges.dedup();
    ranges
}

/// Build the index of a data file by walking its `(key, payload)` words
pub fn build_index(data_path: &Path, index_path: &Path) -> Result<()> {
    let decompressor = Decompressor::open(data_path)?;
    let mut builder = IndexBuilder::new((decompressor.word_count() / 2) as usize);
    let mut getter = decompressor.make_getter();
    while getter.has_next() {
        let offset = getter.offset();
        let key = getter.next_key()?;
        getter.skip()?;
        builder.add_key(&key, offset);
    }
    builder.build(index_path)
}

/// An immutable shard: word file plus index, covering `[start, end)` txNums.
///
/// Shared through `Arc`. Once marked for deletion, the files are removed
/// when the last holder drops it.
pub struct FilesItem {
    pub start_tx_num: TxNum,
    pub end_tx_num: TxNum,
    pub decompressor: Decompressor,
    pub index: Index,
    can_delete: AtomicBool,
}

impl FilesItem {
    /// Wrap already opened files
    pub fn new(start_tx_num: TxNum, end_tx_num: TxNum, decompressor: Decompressor, index: Index) -> Self {
        Self {
            start_tx_num,
            end_tx_num,
            decompressor,
            index,
            can_delete: AtomicBool::new(false),
        }
    }

    /// Open a data file and its index
    pub fn open(data_path: &Path, index_path: &Path, start_tx_num: TxNum, end_tx_num: TxNum) -> Result<Self> {
        let decompressor = Decompressor::open(data_path)?;
        let index = Index::open(index_path)?;
        Ok(Self::new(start_tx_num, end_tx_num, decompressor, index))
    }

    /// Delete the files once the last reference is gone
    pub fn mark_for_deletion(&self) {
        self.can_delete.store(true, Ordering::Release);
    }

    /// Check if the item is scheduled for deletion
    pub fn is_marked_for_deletion(&self) -> bool {
        self.can_delete.load(Ordering::Acquire)
    }

    /// Same range as `other`
    pub fn same_range(&self, other: &FilesItem) -> bool {
        self.start_tx_num == other.start_tx_num && self.end_tx_num == other.end_tx_num
    }

    /// Strictly covered by `other`
    pub fn is_subset_of(&self, other: &FilesItem) -> bool {
        other.start_tx_num <= self.start_tx_num
            && self.end_tx_num <= other.end_tx_num
            && !self.same_range(other)
    }

    /// Check if `tx_num` falls in `[start, end)`
    pub fn contains(&self, tx_num: TxNum) -> bool {
        self.start_tx_num <= tx_num && tx_num < self.end_tx_num
    }

    /// Bytes on disk
    pub fn size(&self) -> u64 {
        self.decompressor.size() + self.index.size()
    }

    /// Number of `(key, payload)` pairs
    pub fn key_count(&self) -> u64 {
        self.index.key_count()
    }

    /// Payload stored for `key`; a nil payload reads as [`Value::Deleted`]
    pub fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        if self.index.key_count() == 0 {
            return Ok(None);
        }
        let mut getter = self.decompressor.make_getter();
        getter.reset(self.index.lookup(key));
        if !getter.has_next() || getter.next_key()? != key {
            return Ok(None);
        }
        Ok(Some(Value::from_word(getter.next()?)))
    }

    /// Cursor over all pairs in key order
    pub fn cursor(&self) -> PairCursor {
        PairCursor {
            getter: self.decompressor.make_getter(),
        }
    }
}

impl fmt::Debug for FilesItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilesItem")
            .field("path", &self.decompressor.path())
            .field("start_tx_num", &self.start_tx_num)
            .field("end_tx_num", &self.end_tx_num)
            .finish()
    }
}

impl Drop for FilesItem {
    fn drop(&mut self) {
        if !self.is_marked_for_deletion() {
            return;
        }
        for path in [self.decompressor.path(), self.index.path()] {
            match std::fs::remove_file(path) {
                Ok(()) => debug!("Deleted {:?}", path),
                Err(e) => warn!("Failed to delete {:?}: {}", path, e),
            }
        }
    }
}

/// Forward cursor over the `(key, payload)` pairs of a shard
pub struct PairCursor {
    getter: Getter,
}

impl PairCursor {
    /// Next pair, or `None` at the end of the file
    pub fn next_pair(&mut self) -> Result<Option<(Vec<u8>, Value)>> {
        if !self.getter.has_next() {
            return Ok(None);
        }
        let key = self.getter.next_key()?;
        let value = Value::from_word(self.getter.next()?);
        Ok(Some((key, value)))
    }
}

/// Registered shards of one kind, ordered by `(end, start)`
#[derive(Default)]
pub(crate) struct FileSet {
    items: BTreeMap<(TxNum, TxNum), Arc<FilesItem>>,
    visible: Arc<Vec<Arc<FilesItem>>>,
}

impl FileSet {
    /// Register a shard; a shard with the same range is replaced
    pub fn insert(&mut self, item: Arc<FilesItem>) {
        self.items.insert((item.end_tx_num, item.start_tx_num), item);
        self.recalc_visible();
    }

    /// Unregister a shard
    pub fn remove(&mut self, item: &FilesItem) -> Option<Arc<FilesItem>> {
        let removed = self.items.remove(&(item.end_tx_num, item.start_tx_num));
        self.recalc_visible();
        removed
    }

    /// Drop every shard without deleting files
    pub fn clear(&mut self) {
        self.items.clear();
        self.recalc_visible();
    }

    /// Disjoint shards serving reads, ascending
    pub fn visible(&self) -> Arc<Vec<Arc<FilesItem>>> {
        self.visible.clone()
    }

    /// All registered shards, ascending by `(end, start)`
    pub fn items(&self) -> impl Iterator<Item = &Arc<FilesItem>> {
        self.items.values()
    }

    /// Number of registered shards
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// End of the newest visible shard, `0` when empty
    pub fn end_tx_num(&self) -> TxNum {
        self.visible.last().map_or(0, |item| item.end_tx_num)
    }

    /// Bytes on disk across registered shards
    pub fn size(&self) -> u64 {
        self.items.values().map(|item| item.size()).sum()
    }

    fn recalc_visible(&mut self) {
        let items: Vec<&Arc<FilesItem>> = self.items.values().collect();
        let visible = items
            .iter()
            .filter(|item| !items.iter().any(|other| item.is_subset_of(other)))
            .map(|item| Arc::clone(item))
            .collect();
        self.visible = Arc::new(visible);
    }
}

/// Path of a shard file in `dir`
pub(crate) fn shard_path(dir: &Path, base: &str, start_step: Step, end_step: Step, ext: &str) -> PathBuf {
    dir.join(file_name(base, start_step, end_step, ext))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seg::{WordConfig, WordWriter};
    use tempfile::TempDir;

    fn write_shard(dir: &Path, name: &str, pairs: &[(&[u8], Option<&[u8]>)]) -> (PathBuf, PathBuf) {
        let data = dir.join(format!("{}.kv", name));
        let index = dir.join(format!("{}.kvi", name));
        let mut writer = WordWriter::create(&data, WordConfig::default()).unwrap();
        let mut builder = IndexBuilder::new(pairs.len());
        for (key, value) in pairs {
            let offset = writer.add_word(key).unwrap();
            writer.add_optional(*value).unwrap();
            builder.add_key(key, offset);
        }
        writer.finish().unwrap();
        builder.build(&index).unwrap();
        (data, index)
    }

    #[test]
    fn test_parse_file_name() {
        assert_eq!(
            parse_file_name("base.0-4.kv", "base", "kv"),
            Some(FileRange { start_step: 0, end_step: 4 })
        );
        assert_eq!(parse_file_name("base.0-4.kvi", "base", "kv"), None);
        assert_eq!(parse_file_name("base.4-4.kv", "base", "kv"), None);
        assert_eq!(parse_file_name("other.0-1.kv", "base", "kv"), None);
        assert_eq!(parse_file_name("base.a-1.kv", "base", "kv"), None);
        assert_eq!(file_name("base", 2, 3, "ef"), "base.2-3.ef");
    }

    #[test]
    fn test_scan_state_files_keeps_supersets() {
        let names = [
            "test.0-1.kv",
            "test.1-2.kv",
            "test.0-4.kv",
            "test.2-3.kv",
            "test.3-4.kv",
            "test.4-5.kv",
            "test.4-5.kvi",
            "test.0-1.v",
            "test.x-1.kv",
        ];
        let ranges = scan_state_files(&names, "test", FileKind::Values);
        assert_eq!(ranges.len(), 6);
        assert_eq!(ranges[0], FileRange { start_step: 0, end_step: 1 });
        assert!(ranges.contains(&FileRange { start_step: 0, end_step: 4 }));

        assert_eq!(scan_state_files(&names, "test", FileKind::History).len(), 1);
    }

    #[test]
    fn test_visible_list_prefers_wider_shards() {
        let temp_dir = TempDir::new().unwrap();
        let mut set = FileSet::default();
        for (name, start, end) in [("a", 0, 16), ("b", 16, 32), ("c", 0, 32), ("d", 32, 48)] {
            let (data, index) = write_shard(temp_dir.path(), name, &[(b"key1", Some(b"v"))]);
            set.insert(Arc::new(FilesItem::open(&data, &index, start, end).unwrap()));
        }

        assert_eq!(set.len(), 4);
        let visible: Vec<_> = set
            .visible()
            .iter()
            .map(|item| (item.start_tx_num, item.end_tx_num))
            .collect();
        assert_eq!(visible, vec![(0, 32), (32, 48)]);
        assert_eq!(set.end_tx_num(), 48);
    }

    #[test]
    fn test_get_and_cursor() {
        let temp_dir = TempDir::new().unwrap();
        let (data, index) = write_shard(
            temp_dir.path(),
            "base.0-1",
            &[(b"key1", Some(b"value1")), (b"key2", None), (b"key3", Some(b""))],
        );
        let item = FilesItem::open(&data, &index, 0, 16).unwrap();

        assert_eq!(item.get(b"key1").unwrap(), Some(Value::present("value1")));
        assert_eq!(item.get(b"key2").unwrap(), Some(Value::Deleted));
        assert_eq!(item.get(b"key3").unwrap(), Some(Value::present("")));
        assert_eq!(item.get(b"key4").unwrap(), None);

        let mut cursor = item.cursor();
        let mut keys = Vec::new();
        while let Some((key, _)) = cursor.next_pair().unwrap() {
            keys.push(key);
        }
        assert_eq!(keys, vec![b"key1".to_vec(), b"key2".to_vec(), b"key3".to_vec()]);
    }

    #[test]
    fn test_marked_item_deletes_files_on_last_drop() {
        let temp_dir = TempDir::new().unwrap();
        let (data, index) = write_shard(temp_dir.path(), "base.0-1", &[(b"key1", Some(b"v"))]);
        let item = Arc::new(FilesItem::open(&data, &index, 0, 16).unwrap());
        let reader = Arc::clone(&item);

        item.mark_for_deletion();
        drop(item);
        assert!(data.exists());
        assert_eq!(reader.get(b"key1").unwrap(), Some(Value::present("v")));

        drop(reader);
        assert!(!data.exists());
        assert!(!index.exists());
    }

    #[test]
    fn test_build_index_from_data_file() {
        let temp_dir = TempDir::new().unwrap();
        let (data, index) = write_shard(
            temp_dir.path(),
            "base.0-1",
            &[(b"key1", Some(b"value1")), (b"key2", None)],
        );
        std::fs::remove_file(&index).unwrap();

        build_index(&data, &index).unwrap();
        let item = FilesItem::open(&data, &index, 0, 16).unwrap();
        assert_eq!(item.key_count(), 2);
        assert_eq!(item.get(b"key2").unwrap(), Some(Value::Deleted));
    }
}
