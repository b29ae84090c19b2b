//! Point-in-time read view over the hot store and pinned shards

use super::inverted_index::{decode_tx_nums, seek};
use super::iter::DomainIter;
use super::merge::{files_in_range, DomainRanges};
use super::{DomainConfig, FilesItem};
use crate::kv::{prefix_successor, Tx};
use crate::{
    compose_key, decode_inverted_step, decode_tx_num, encode_tx_num, key_with_suffix, Result, Step,
    StrataError, TxNum, Value,
};
use std::sync::Arc;

type Pinned = Arc<Vec<Arc<FilesItem>>>;

/// Read view created by [`super::Domain::make_context`].
///
/// Holds references to the shards visible at creation time; shards retired
/// by a merge meanwhile stay readable until the context is dropped.
pub struct DomainContext {
    config: Arc<DomainConfig>,
    values: Pinned,
    history: Pinned,
    index: Pinned,
}

impl DomainContext {
    pub(crate) fn new(config: Arc<DomainConfig>, values: Pinned, history: Pinned, index: Pinned) -> Self {
        Self {
            config,
            values,
            history,
            index,
        }
    }

    /// Latest value of `key ++ subkey`; `None` if never written or deleted
    pub fn get_latest<T: Tx + ?Sized>(&self, key: &[u8], subkey: &[u8], tx: &T) -> Result<Option<Vec<u8>>> {
        self.get_latest_full(&compose_key(key, subkey), tx)
    }

    pub(crate) fn get_latest_full<T: Tx + ?Sized>(&self, key: &[u8], tx: &T) -> Result<Option<Vec<u8>>> {
        if let Some(value) = self.hot_latest(key, tx)? {
            return Ok(value.into_bytes());
        }
        Ok(self.latest_from_files(key)?.and_then(Value::into_bytes))
    }

    /// Value of `key` just before `tx_num`; `None` if it held no value then
    pub fn get_before_tx_num<T: Tx + ?Sized>(&self, key: &[u8], tx_num: TxNum, tx: &T) -> Result<Option<Vec<u8>>> {
        if !self.config.with_history {
            return Err(StrataError::HistoryDisabled);
        }

        // the value before the first change at or after tx_num is the answer
        for item in self.index.iter().filter(|item| item.end_tx_num > tx_num) {
            let Some(Value::Present(encoded)) = item.get(key)? else {
                continue;
            };
            if let Some(change) = seek(&decode_tx_nums(&encoded)?, tx_num) {
                return self.history_from_files(key, change);
            }
        }

        let tables = &self.config.tables;
        if let Some(change) = tx.seek_dup(&tables.index, key, &encode_tx_num(tx_num))? {
            let change = decode_tx_num(&change)?;
            let encoded = tx
                .get(&tables.history_vals, &key_with_suffix(key, change))?
                .ok_or_else(|| {
                    StrataError::Corruption(format!(
                        "Change of {:?} at txNum {} has no history row",
                        String::from_utf8_lossy(key),
                        change
                    ))
                })?;
            return Ok(Value::decode(&encoded)?.into_bytes());
        }

        // no change since tx_num
        self.get_latest_full(key, tx)
    }

    /// Visit every live key starting with `prefix` in ascending order
    pub fn iterate_prefix<T, F>(&self, prefix: &[u8], tx: &T, mut visit: F) -> Result<()>
    where
        T: Tx + ?Sized,
        F: FnMut(&[u8], &[u8]),
    {
        let to = prefix_successor(prefix);
        for entry in self.iterate_prefix2(prefix, to.as_deref(), None, tx)? {
            let (key, value) = entry?;
            visit(&key, &value);
        }
        Ok(())
    }

    /// Cursor over live keys in `[from, to)`, yielding at most `limit` pairs
    pub fn iterate_prefix2<'a, T: Tx + ?Sized>(
        &self,
        from: &[u8],
        to: Option<&[u8]>,
        limit: Option<usize>,
        tx: &'a T,
    ) -> Result<DomainIter<'a>> {
        DomainIter::new(
            &self.config,
            Arc::clone(&self.values),
            self.files_end_step(),
            from,
            to,
            limit,
            tx,
        )
    }

    /// Shards of each kind inside the merge ranges: `(values, index, history)`
    pub fn static_files_in_range(
        &self,
        r: &DomainRanges,
    ) -> Result<(Vec<Arc<FilesItem>>, Vec<Arc<FilesItem>>, Vec<Arc<FilesItem>>)> {
        let values = match r.values {
            Some(range) => files_in_range(&self.values, range)?,
            None => Vec::new(),
        };
        let index = match r.index {
            Some(range) => files_in_range(&self.index, range)?,
            None => Vec::new(),
        };
        let history = match r.history {
            Some(range) => files_in_range(&self.history, range)?,
            None => Vec::new(),
        };
        if r.history.is_some() && r.index.is_some() && history.len() != index.len() {
            return Err(StrataError::InconsistentFiles(format!(
                "{} history files but {} index files in merge range",
                history.len(),
                index.len()
            )));
        }
        Ok((values, index, history))
    }

    /// Pinned values shards, ascending
    pub fn values_files(&self) -> &[Arc<FilesItem>] {
        &self.values
    }

    /// Release the pinned shards
    pub fn close(self) {}

    /// First step not covered by values shards
    fn files_end_step(&self) -> Step {
        let end = self.values.last().map_or(0, |item| item.end_tx_num);
        end / self.config.aggregation_step
    }

    /// Newest hot-store value of `key`, if its step is not yet in the shards
    fn hot_latest<T: Tx + ?Sized>(&self, key: &[u8], tx: &T) -> Result<Option<Value>> {
        let tables = &self.config.tables;
        let Some(inverted) = tx.get(&tables.keys, key)? else {
            return Ok(None);
        };
        let step = decode_inverted_step(&inverted)?;
        if step < self.files_end_step() {
            return Ok(None);
        }
        match tx.get(&tables.vals, &key_with_suffix(key, !step))? {
            Some(encoded) => Ok(Some(Value::decode(&encoded)?)),
            None => Err(StrataError::Corruption(format!(
                "No value row for key {:?} at step {}",
                String::from_utf8_lossy(key),
                step
            ))),
        }
    }

    /// Newest shard value of `key`, widest shard first among equal ends
    fn latest_from_files(&self, key: &[u8]) -> Result<Option<Value>> {
        for item in self.values.iter().rev() {
            if let Some(value) = item.get(key)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    fn history_from_files(&self, key: &[u8], change: TxNum) -> Result<Option<Vec<u8>>> {
        let item = self
            .history
            .iter()
            .find(|item| item.contains(change))
            .ok_or_else(|| {
                StrataError::InconsistentFiles(format!("No history file covers txNum {}", change))
            })?;
        match item.get(&key_with_suffix(key, change))? {
            Some(value) => Ok(value.into_bytes()),
            None => Err(StrataError::InconsistentFiles(format!(
                "History file {:?} lacks the change of {:?} at txNum {}",
                item.decompressor.path(),
                String::from_utf8_lossy(key),
                change
            ))),
        }
    }
}
