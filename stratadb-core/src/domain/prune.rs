//! Pruning collated rows and unwinding uncollated ones

use super::Domain;
use crate::kv::RwTx;
use crate::{
    decode_inverted_step, decode_tx_num, encode_inverted_step, encode_tx_num, key_with_suffix, Result, Step, StrataError,
    TxNum, Value,
};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::info;

impl Domain {
    /// Delete hot-store rows already persisted in shard files: values of
    /// `step` and history in `[tx_from, tx_to)`, at most `limit` rows per call
    pub fn prune<T: RwTx + ?Sized>(
        &self,
        step: Step,
        tx_from: TxNum,
        tx_to: TxNum,
        limit: u64,
        log_every: Duration,
        tx: &mut T,
    ) -> Result<()> {
        let config = &self.config;
        let tables = &config.tables;

        let values_end = self.values.read().end_tx_num();
        if (step + 1) * config.aggregation_step > values_end {
            return Err(StrataError::PruneUncollated {
                tx_to: (step + 1) * config.aggregation_step,
                files_end: values_end,
            });
        }
        if config.with_history {
            let history_end = self.history.read().end_tx_num();
            if tx_to > history_end {
                return Err(StrataError::PruneUncollated {
                    tx_to,
                    files_end: history_end,
                });
            }
        }

        let started = Instant::now();
        let mut last_log = started;
        let mut pruned = 0u64;
        let mut log_progress = |pruned: u64, what: &str| {
            if last_log.elapsed() >= log_every {
                info!(
                    "[{}] prune {} step {}: {} rows",
                    config.filename_base, what, step, pruned
                );
                last_log = Instant::now();
            }
        };

        let inverted = encode_inverted_step(step);
        let mut keys = Vec::new();
        for row in tx.range(&tables.keys, &[], None)? {
            if keys.len() as u64 >= limit {
                break;
            }
            let (key, value) = row?;
            if value == inverted {
                keys.push(key);
            }
        }
        for key in keys {
            tx.delete(&tables.keys, &key, Some(&inverted[..]))?;
            tx.delete(&tables.vals, &key_with_suffix(&key, !step), None)?;
            pruned += 1;
            log_progress(pruned, "values");
        }

        if config.with_history && pruned < limit {
            let from = encode_tx_num(tx_from);
            let to = encode_tx_num(tx_to);
            let rows = tx
                .range(&tables.history_keys, &from, Some(&to[..]))?
                .take((limit - pruned).try_into().unwrap_or(usize::MAX))
                .collect::<Result<Vec<_>>>()?;
            for (tx_num, key) in rows {
                tx.delete(&tables.history_keys, &tx_num, Some(key.as_slice()))?;
                tx.delete(&tables.history_vals, &key_with_suffix(&key, decode_tx_num(&tx_num)?), None)?;
                tx.delete(&tables.index, &key, Some(tx_num.as_slice()))?;
                pruned += 1;
                log_progress(pruned, "history");
            }
        }

        info!(
            "Pruned {} rows of {} for step {} in {:?}",
            pruned,
            config.filename_base,
            step,
            started.elapsed()
        );
        Ok(())
    }

    /// Forget every buffered write with txNum in `(tx_from, tx_to]`, restoring
    /// the values each key held at `tx_from`
    pub fn unwind<T: RwTx + ?Sized>(&self, tx_from: TxNum, tx_to: TxNum, tx: &mut T) -> Result<()> {
        let config = &self.config;
        let tables = &config.tables;
        let step_size = config.aggregation_step;

        if !config.with_history {
            return Err(StrataError::HistoryDisabled);
        }
        if self.has_unflushed_writes() {
            return Err(StrataError::UnflushedWrites);
        }
        let files_end = self.values.read().end_tx_num();
        if tx_from + 1 < files_end {
            return Err(StrataError::UnwindIntoFiles { tx_from, files_end });
        }

        // value at tx_from = value before the first unwound change
        let from = encode_tx_num(tx_from + 1);
        let to = tx_to.checked_add(1).map(encode_tx_num);
        let rows = tx
            .range(&tables.history_keys, &from, to.as_ref().map(|t| &t[..]))?
            .collect::<Result<Vec<_>>>()?;
        let mut restored: BTreeMap<Vec<u8>, Value> = BTreeMap::new();
        for (tx_num, key) in &rows {
            let history_key = key_with_suffix(key, decode_tx_num(tx_num)?);
            if !restored.contains_key(key) {
                let encoded = tx.get(&tables.history_vals, &history_key)?.ok_or_else(|| {
                    StrataError::Corruption(format!(
                        "No history row for key {:?}",
                        String::from_utf8_lossy(key)
                    ))
                })?;
                restored.insert(key.clone(), Value::decode(&encoded)?);
            }
            tx.delete(&tables.history_keys, tx_num, Some(key.as_slice()))?;
            tx.delete(&tables.history_vals, &history_key, None)?;
            tx.delete(&tables.index, key, Some(tx_num.as_slice()))?;
        }

        let first_step = (tx_from + 1) / step_size;
        let last_step = tx_to / step_size;
        let first_step_start = first_step * step_size;
        for (key, value) in &restored {
            for inverted in tx.get_dups(&tables.keys, key)? {
                let step = decode_inverted_step(&inverted)?;
                if step < first_step || step > last_step {
                    continue;
                }
                tx.delete(&tables.keys, key, Some(inverted.as_slice()))?;
                tx.delete(&tables.vals, &key_with_suffix(key, !step), None)?;
            }
            // writes at or before tx_from inside first_step keep a row there
            let kept_change = tx
                .seek_dup(&tables.index, key, &encode_tx_num(first_step_start))?
                .map(|t| decode_tx_num(&t))
                .transpose()?
                .map_or(false, |t| t <= tx_from);
            if kept_change {
                tx.put(&tables.keys, key, &encode_inverted_step(first_step))?;
                tx.put(&tables.vals, &key_with_suffix(key, !first_step), &value.encode())?;
            }
        }

        let current = self.tx_num();
        self.tx_num.store(current.min(tx_from), Ordering::Release);

        info!(
            "Unwound {} changes of {} keys in ({}, {}] for {}",
            rows.len(),
            restored.len(),
            tx_from,
            tx_to,
            config.filename_base
        );
        Ok(())
    }
}

