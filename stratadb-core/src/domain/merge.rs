//! Merging adjacent shards into wider ones

use super::collate::write_shard;
use super::files::FileSet;
use super::inverted_index::{decode_tx_nums, encode_tx_nums};
use super::iter::{MergeIter, PairSource};
use super::{Domain, FileKind, FilesItem};
use crate::{Result, StrataError, TxNum, Value};
use std::sync::Arc;
use tracing::{debug, info};

/// `[start, end)` txNum range of a merge output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeRange {
    pub start_tx_num: TxNum,
    pub end_tx_num: TxNum,
}

/// Ranges a merge consumes, per file kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DomainRanges {
    pub values: Option<MergeRange>,
    pub history: Option<MergeRange>,
    pub index: Option<MergeRange>,
}

impl DomainRanges {
    /// Check if any kind has something to merge
    pub fn any(&self) -> bool {
        self.values.is_some() || self.history.is_some() || self.index.is_some()
    }
}

/// Shards produced by a merge, not yet integrated
#[derive(Default)]
pub struct MergedFiles {
    pub values: Option<Arc<FilesItem>>,
    pub index: Option<Arc<FilesItem>>,
    pub history: Option<Arc<FilesItem>>,
}

impl Domain {
    /// Pick the next ranges to merge, ending at or before `max_end_tx_num`
    /// and spanning at most `max_span` txNums
    pub fn find_merge_range(&self, max_end_tx_num: TxNum, max_span: u64) -> DomainRanges {
        let step = self.config.aggregation_step;
        let find = |set: &FileSet| find_range(&set.visible(), step, max_end_tx_num, max_span);

        let mut r = DomainRanges {
            values: find(&self.values.read()),
            ..Default::default()
        };
        if self.config.with_history {
            r.history = find(&self.history.read());
            r.index = find(&self.index.read());
        }
        r
    }

    /// Merge the given shards into one shard per kind
    pub fn merge_files(
        &self,
        values_files: &[Arc<FilesItem>],
        index_files: &[Arc<FilesItem>],
        history_files: &[Arc<FilesItem>],
        r: &DomainRanges,
    ) -> Result<MergedFiles> {
        let mut merged = MergedFiles::default();

        if let Some(range) = r.values {
            // nothing older can resurface under a tombstone starting at 0
            let drop_tombstones = range.start_tx_num == 0;
            let mut merge = MergeIter::new(cursors(values_files), &[])?;
            let mut pairs = Vec::new();
            while let Some((key, value)) = merge.next_newest()? {
                if drop_tombstones && value.is_deleted() {
                    continue;
                }
                pairs.push((key, value.into_bytes()));
            }
            merged.values = Some(self.write_merged(FileKind::Values, range, pairs)?);
        }

        if let Some(range) = r.index {
            let mut merge = MergeIter::new(cursors(index_files), &[])?;
            let mut pairs = Vec::new();
            while let Some((key, group)) = merge.next_group()? {
                let mut tx_nums = Vec::new();
                for (_, value) in group {
                    let Value::Present(encoded) = value else {
                        return Err(StrataError::Corruption(format!(
                            "Nil txNum list for key {:?}",
                            String::from_utf8_lossy(&key)
                        )));
                    };
                    tx_nums.extend(decode_tx_nums(&encoded)?);
                }
                tx_nums.sort_unstable();
                tx_nums.dedup();
                pairs.push((key, Some(encode_tx_nums(&tx_nums))));
            }
            merged.index = Some(self.write_merged(FileKind::Index, range, pairs)?);
        }

        if let Some(range) = r.history {
            let mut merge = MergeIter::new(cursors(history_files), &[])?;
            let mut pairs = Vec::new();
            while let Some((key, value)) = merge.next_newest()? {
                pairs.push((key, value.into_bytes()));
            }
            merged.history = Some(self.write_merged(FileKind::History, range, pairs)?);
        }

        Ok(merged)
    }

    /// Publish merged shards and retire their inputs; the inputs' files are
    /// deleted once no context holds them
    pub fn integrate_merged_files(
        &self,
        values_outs: &[Arc<FilesItem>],
        index_outs: &[Arc<FilesItem>],
        history_outs: &[Arc<FilesItem>],
        merged: MergedFiles,
    ) {
        let mut values = self.values.write();
        let mut history = self.history.write();
        let mut index = self.index.write();

        replace(&mut values, values_outs, merged.values);
        replace(&mut index, index_outs, merged.index);
        replace(&mut history, history_outs, merged.history);

        info!(
            "Integrated merged files of {}: {} values, {} history, {} index files live",
            self.config.filename_base,
            values.len(),
            history.len(),
            index.len()
        );
    }

    fn write_merged(
        &self,
        kind: FileKind,
        range: MergeRange,
        pairs: Vec<(Vec<u8>, Option<Vec<u8>>)>,
    ) -> Result<Arc<FilesItem>> {
        let step = self.config.aggregation_step;
        let (start_step, end_step) = (range.start_tx_num / step, range.end_tx_num / step);
        let data_path = self.data_path(kind, start_step, end_step);
        let count = pairs.len();
        let parts = write_shard(
            &data_path,
            &self.index_path(kind, start_step, end_step),
            self.config.word_config(),
            count,
            pairs,
        )?;
        debug!("Merged {} {} keys into {:?}", count, kind, data_path);

        Ok(Arc::new(FilesItem::new(
            range.start_tx_num,
            range.end_tx_num,
            parts.decompressor,
            parts.index,
        )))
    }
}

fn cursors<'a>(files: &[Arc<FilesItem>]) -> Vec<Box<dyn PairSource + 'a>> {
    // files are ascending, so later sources are newer
    files
        .iter()
        .map(|item| Box::new(item.cursor()) as Box<dyn PairSource + 'a>)
        .collect()
}

fn replace(set: &mut FileSet, outs: &[Arc<FilesItem>], merged: Option<Arc<FilesItem>>) {
    let Some(merged) = merged else {
        return;
    };
    for out in outs {
        set.remove(out);
        if !out.same_range(&merged) {
            out.mark_for_deletion();
        }
    }
    set.insert(merged);
}

/// Smallest-start aligned range ending at a visible shard's end whose
/// visible shards tile it with at least two pieces; the widest such range
/// among equal starts
fn find_range(visible: &[Arc<FilesItem>], step: u64, max_end_tx_num: TxNum, max_span: u64) -> Option<MergeRange> {
    // merged shards are named by step, so spans stay step-aligned
    let max_span = max_span - max_span % step;
    let mut best: Option<MergeRange> = None;
    for item in visible {
        if item.end_tx_num > max_end_tx_num {
            continue;
        }
        let end_step = item.end_tx_num / step;
        if end_step == 0 {
            continue;
        }
        // widest power-of-two aligned span ending at end_step
        let span_step = end_step & end_step.wrapping_neg();
        let span = span_step.saturating_mul(step).min(max_span);
        let start = item.end_tx_num.saturating_sub(span);
        if start >= item.start_tx_num {
            continue;
        }
        // equal starts: the later, wider candidate replaces the earlier one
        if best.map_or(false, |b| b.start_tx_num < start) {
            continue;
        }
        let candidate = MergeRange {
            start_tx_num: start,
            end_tx_num: item.end_tx_num,
        };
        if files_in_range(visible, candidate).is_ok() {
            best = Some(candidate);
        }
    }
    best
}

/// Visible shards inside `range`; they must tile it exactly
pub(crate) fn files_in_range(visible: &[Arc<FilesItem>], range: MergeRange) -> Result<Vec<Arc<FilesItem>>> {
    let files: Vec<Arc<FilesItem>> = visible
        .iter()
        .filter(|item| item.start_tx_num >= range.start_tx_num && item.end_tx_num <= range.end_tx_num)
        .cloned()
        .collect();

    let mut expected = range.start_tx_num;
    for item in &files {
        if item.start_tx_num != expected {
            return Err(StrataError::InconsistentFiles(format!(
                "Gap in merge range [{}, {}): expected a file starting at {}, found {}",
                range.start_tx_num, range.end_tx_num, expected, item.start_tx_num
            )));
        }
        expected = item.end_tx_num;
    }
    if expected != range.end_tx_num || files.len() < 2 {
        return Err(StrataError::InconsistentFiles(format!(
            "Files do not cover merge range [{}, {})",
            range.start_tx_num, range.end_tx_num
        )));
    }
    Ok(files)
}
