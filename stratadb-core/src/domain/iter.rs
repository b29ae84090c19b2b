//! K-way merge over sorted pair sources

use super::files::PairCursor;
use super::{DomainConfig, FilesItem};
use crate::kv::{KvIter, Tx};
use crate::{decode_inverted_step, key_with_suffix, Result, Step, StrataError, Value};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::iter::Peekable;
use std::sync::Arc;

/// A source of `(key, value)` pairs in ascending key order, one pair per key
pub(crate) trait PairSource {
    fn next_pair(&mut self) -> Result<Option<(Vec<u8>, Value)>>;
}

impl PairSource for PairCursor {
    fn next_pair(&mut self) -> Result<Option<(Vec<u8>, Value)>> {
        PairCursor::next_pair(self)
    }
}

struct HeapEntry {
    key: Vec<u8>,
    value: Value,
    /// Index into the sources; higher is newer
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // max-heap: smallest key first, newest source first among equal keys
        other
            .key
            .cmp(&self.key)
            .then_with(|| self.source.cmp(&other.source))
    }
}

/// Merges sources in key order. Sources are passed oldest first.
pub(crate) struct MergeIter<'a> {
    sources: Vec<Box<dyn PairSource + 'a>>,
    heap: BinaryHeap<HeapEntry>,
}

impl<'a> MergeIter<'a> {
    /// Start merging, skipping keys below `from`
    pub fn new(mut sources: Vec<Box<dyn PairSource + 'a>>, from: &[u8]) -> Result<Self> {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (source, src) in sources.iter_mut().enumerate() {
            while let Some((key, value)) = src.next_pair()? {
                if key.as_slice() >= from {
                    heap.push(HeapEntry { key, value, source });
                    break;
                }
            }
        }
        Ok(Self { sources, heap })
    }

    /// Next key with every source's value for it, newest source first
    pub fn next_group(&mut self) -> Result<Option<(Vec<u8>, Vec<(usize, Value)>)>> {
        let Some(top) = self.heap.pop() else {
            return Ok(None);
        };
        self.advance(top.source)?;

        let key = top.key;
        let mut group = vec![(top.source, top.value)];
        while self.heap.peek().map_or(false, |next| next.key == key) {
            if let Some(dup) = self.heap.pop() {
                self.advance(dup.source)?;
                group.push((dup.source, dup.value));
            }
        }
        Ok(Some((key, group)))
    }

    /// Next key with the value of the newest source holding it
    pub fn next_newest(&mut self) -> Result<Option<(Vec<u8>, Value)>> {
        Ok(self
            .next_group()?
            .and_then(|(key, group)| group.into_iter().next().map(|(_, value)| (key, value))))
    }

    fn advance(&mut self, source: usize) -> Result<()> {
        if let Some((key, value)) = self.sources[source].next_pair()? {
            self.heap.push(HeapEntry { key, value, source });
        }
        Ok(())
    }
}

/// Hot-store rows of keys whose newest step is not covered by shards
struct HotSource<'a, T: Tx + ?Sized> {
    rows: Peekable<KvIter<'a>>,
    tx: &'a T,
    vals_table: String,
    files_end_step: Step,
}

impl<T: Tx + ?Sized> PairSource for HotSource<'_, T> {
    fn next_pair(&mut self) -> Result<Option<(Vec<u8>, Value)>> {
        loop {
            let Some(row) = self.rows.next() else {
                return Ok(None);
            };
            // first duplicate of a key is its newest step
            let (key, inverted) = row?;
            while let Some(Ok((next, _))) = self.rows.peek() {
                if *next != key {
                    break;
                }
                self.rows.next();
            }

            let step = decode_inverted_step(&inverted)?;
            if step < self.files_end_step {
                continue;
            }
            let encoded = self
                .tx
                .get(&self.vals_table, &key_with_suffix(&key, !step))?
                .ok_or_else(|| {
                    StrataError::Corruption(format!(
                        "No value row for key {:?} at step {}",
                        String::from_utf8_lossy(&key),
                        step
                    ))
                })?;
            return Ok(Some((key, Value::decode(&encoded)?)));
        }
    }
}

/// Ascending cursor over live keys of a context, merging hot rows with
/// every pinned values shard. Deleted keys are skipped.
pub struct DomainIter<'a> {
    merge: MergeIter<'a>,
    to: Option<Vec<u8>>,
    remaining: Option<usize>,
    peeked: Option<Result<(Vec<u8>, Vec<u8>)>>,
    done: bool,
    _files: Arc<Vec<Arc<FilesItem>>>,
}

impl<'a> DomainIter<'a> {
    pub(crate) fn new<T: Tx + ?Sized>(
        config: &DomainConfig,
        files: Arc<Vec<Arc<FilesItem>>>,
        files_end_step: Step,
        from: &[u8],
        to: Option<&[u8]>,
        limit: Option<usize>,
        tx: &'a T,
    ) -> Result<Self> {
        let mut sources: Vec<Box<dyn PairSource + 'a>> = files
            .iter()
            .map(|item| Box::new(item.cursor()) as Box<dyn PairSource + 'a>)
            .collect();
        sources.push(Box::new(HotSource {
            rows: tx.range(&config.tables.keys, from, to)?.peekable(),
            tx,
            vals_table: config.tables.vals.clone(),
            files_end_step,
        }));

        Ok(Self {
            merge: MergeIter::new(sources, from)?,
            to: to.map(<[u8]>::to_vec),
            remaining: limit,
            peeked: None,
            done: false,
            _files: files,
        })
    }

    /// Check if another pair follows
    pub fn has_next(&mut self) -> bool {
        if self.peeked.is_none() {
            self.peeked = self.advance();
        }
        self.peeked.is_some()
    }

    fn advance(&mut self) -> Option<Result<(Vec<u8>, Vec<u8>)>> {
        if self.done || self.remaining == Some(0) {
            return None;
        }
        loop {
            let (key, value) = match self.merge.next_newest() {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            if self.to.as_ref().map_or(false, |to| key >= *to) {
                self.done = true;
                return None;
            }
            if let Value::Present(value) = value {
                if let Some(remaining) = self.remaining.as_mut() {
                    *remaining -= 1;
                }
                return Some(Ok((key, value)));
            }
        }
    }
}

impl Iterator for DomainIter<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.peeked.take().or_else(|| self.advance())
    }
}
