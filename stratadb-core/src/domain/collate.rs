//! Collation of buffered rows into shard files

use super::files::shard_path;
use super::inverted_index::encode_tx_nums;
use super::{Domain, FileKind, FilesItem, InvertedIndex};
use crate::kv::Tx;
use crate::recsplit::{Index, IndexBuilder};
use crate::seg::{Decompressor, WordConfig, WordWriter};
use crate::{
    decode_inverted_step, decode_tx_num, encode_tx_num, key_with_suffix, Result, Step, StrataError,
    TxNum, Value,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// One step's rows drained from the hot store, ready to be written
#[derive(Debug)]
pub struct Collation {
    /// Where the values file will be written
    pub values_path: PathBuf,
    /// Latest value per key in the step, sorted by key
    pub values: Vec<(Vec<u8>, Value)>,
    pub values_count: usize,
    /// Where the history file will be written
    pub history_path: PathBuf,
    /// Value before each change, sorted by `(key, txNum)`
    pub history: Vec<(Vec<u8>, TxNum, Value)>,
    pub history_count: usize,
    /// Change txNums per key
    pub index_bitmaps: InvertedIndex,
}

/// An opened word file with its index
pub struct ShardParts {
    pub decompressor: Decompressor,
    pub index: Index,
}

/// Files built from one collation, not yet visible to readers
pub struct StaticFiles {
    pub values: ShardParts,
    pub history: Option<ShardParts>,
    pub index: Option<ShardParts>,
}

impl Domain {
    /// Drain the rows of `step` (values) and `[tx_from, tx_to)` (history)
    /// from the hot store
    pub fn collate<T: Tx + ?Sized>(&self, step: Step, tx_from: TxNum, tx_to: TxNum, tx: &T) -> Result<Collation> {
        let config = &self.config;
        let tables = &config.tables;

        let mut values = Vec::new();
        for row in tx.range(&tables.keys, &[], None)? {
            let (key, inverted) = row?;
            if decode_inverted_step(&inverted)? != step {
                continue;
            }
            let encoded = tx
                .get(&tables.vals, &key_with_suffix(&key, !step))?
                .ok_or_else(|| {
                    StrataError::Corruption(format!(
                        "No value row for key {:?} at step {}",
                        String::from_utf8_lossy(&key),
                        step
                    ))
                })?;
            values.push((key, Value::decode(&encoded)?));
        }

        let mut history = BTreeMap::new();
        let mut index_bitmaps = InvertedIndex::new();
        if config.with_history {
            let from = encode_tx_num(tx_from);
            let to = encode_tx_num(tx_to);
            for row in tx.range(&tables.history_keys, &from, Some(&to[..]))? {
                let (tx_num, key) = row?;
                let tx_num = decode_tx_num(&tx_num)?;
                let encoded = tx
                    .get(&tables.history_vals, &key_with_suffix(&key, tx_num))?
                    .ok_or_else(|| {
                        StrataError::Corruption(format!(
                            "No history row for key {:?} at txNum {}",
                            String::from_utf8_lossy(&key),
                            tx_num
                        ))
                    })?;
                index_bitmaps.add(&key, tx_num);
                history.insert((key, tx_num), Value::decode(&encoded)?);
            }
        }
        let history: Vec<_> = history
            .into_iter()
            .map(|((key, tx_num), value)| (key, tx_num, value))
            .collect();

        let dir = &config.dir;
        let base = &config.filename_base;
        debug!(
            "Collated step {} of {}: {} values, {} history entries",
            step,
            base,
            values.len(),
            history.len()
        );
        Ok(Collation {
            values_path: shard_path(dir, base, step, step + 1, FileKind::Values.data_ext()),
            values_count: values.len(),
            values,
            history_path: shard_path(dir, base, step, step + 1, FileKind::History.data_ext()),
            history_count: history.len(),
            history,
            index_bitmaps,
        })
    }

    /// Write a collation to shard files for `step`
    pub fn build_files(&self, step: Step, collation: Collation) -> Result<StaticFiles> {
        let word_config = self.config.word_config();

        let values = write_shard(
            &collation.values_path,
            &self.index_path(FileKind::Values, step, step + 1),
            word_config,
            collation.values.len(),
            collation
                .values
                .iter()
                .map(|(key, value)| (key.clone(), value.as_bytes().map(<[u8]>::to_vec))),
        )?;

        let (history, index) = if self.config.with_history {
            let history = write_shard(
                &collation.history_path,
                &self.index_path(FileKind::History, step, step + 1),
                word_config,
                collation.history.len(),
                collation.history.iter().map(|(key, tx_num, value)| {
                    (key_with_suffix(key, *tx_num), value.as_bytes().map(<[u8]>::to_vec))
                }),
            )?;
            let index = write_shard(
                &self.data_path(FileKind::Index, step, step + 1),
                &self.index_path(FileKind::Index, step, step + 1),
                word_config,
                collation.index_bitmaps.len(),
                collation
                    .index_bitmaps
                    .iter()
                    .map(|(key, tx_nums)| (key.to_vec(), Some(encode_tx_nums(tx_nums)))),
            )?;
            (Some(history), Some(index))
        } else {
            (None, None)
        };

        info!(
            "Built files for step {} of {}: {} values, {} history entries",
            step, self.config.filename_base, collation.values_count, collation.history_count
        );
        Ok(StaticFiles {
            values,
            history,
            index,
        })
    }

    /// Make built files visible to contexts created from now on
    pub fn integrate_files(&self, sf: StaticFiles, tx_from: TxNum, tx_to: TxNum) {
        let mut values = self.values.write();
        let mut history = self.history.write();
        let mut index = self.index.write();

        let item = |parts: ShardParts| {
            Arc::new(FilesItem::new(tx_from, tx_to, parts.decompressor, parts.index))
        };
        values.insert(item(sf.values));
        if let Some(parts) = sf.history {
            history.insert(item(parts));
        }
        if let Some(parts) = sf.index {
            index.insert(item(parts));
        }

        info!(
            "Integrated files [{}, {}) of {}",
            tx_from, tx_to, self.config.filename_base
        );
    }

    pub(crate) fn data_path(&self, kind: FileKind, start_step: Step, end_step: Step) -> PathBuf {
        shard_path(&self.config.dir, &self.config.filename_base, start_step, end_step, kind.data_ext())
    }

    pub(crate) fn index_path(&self, kind: FileKind, start_step: Step, end_step: Step) -> PathBuf {
        shard_path(&self.config.dir, &self.config.filename_base, start_step, end_step, kind.index_ext())
    }
}

/// Write sorted `(key, payload)` pairs and their index; `None` payloads are nil words
pub(crate) fn write_shard<I>(
    data_path: &Path,
    index_path: &Path,
    word_config: WordConfig,
    count: usize,
    pairs: I,
) -> Result<ShardParts>
where
    I: IntoIterator<Item = (Vec<u8>, Option<Vec<u8>>)>,
{
    let mut writer = WordWriter::create(data_path, word_config)?;
    let mut builder = IndexBuilder::new(count);
    for (key, payload) in pairs {
        let offset = writer.add_word(&key)?;
        writer.add_optional(payload.as_deref())?;
        builder.add_key(&key, offset);
    }
    writer.finish()?;
    builder.build(index_path)?;

    Ok(ShardParts {
        decompressor: Decompressor::open(data_path)?,
        index: Index::open(index_path)?,
    })
}
