//! In-memory write buffer in front of the hot store
//!
//! Writes land here first; [`super::Domain::rotate`] swaps the buffer out as
//! a [`FlushBatch`], and [`FlushBatch::flush`] writes it to the hot store
//! tables.

use super::DomainConfig;
use crate::kv::RwTx;
use crate::{encode_inverted_step, encode_tx_num, key_with_suffix, Result, Step, TxNum, Value};
use crossbeam_skiplist::SkipMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Buffered rows of one write session
pub(crate) struct WriteBuffer {
    /// Latest value per key, for read-through
    latest: SkipMap<Vec<u8>, Value>,
    /// Latest value per `(key, step)`
    vals: SkipMap<(Vec<u8>, Step), Value>,
    /// Value before the first write of `key` at `txNum`
    history: SkipMap<(TxNum, Vec<u8>), Value>,
    size_bytes: AtomicUsize,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self {
            latest: SkipMap::new(),
            vals: SkipMap::new(),
            history: SkipMap::new(),
            size_bytes: AtomicUsize::new(0),
        }
    }

    /// Record `value` for `key` at `tx_num`; `prev` is the value it replaces
    pub fn put(&self, key: Vec<u8>, step: Step, tx_num: TxNum, value: Value, prev: Option<Value>) {
        let entry_size = 2 * key.len() + 16 + value.size();
        if let Some(prev) = prev {
            let history_key = (tx_num, key.clone());
            if !self.history.contains_key(&history_key) {
                self.size_bytes.fetch_add(key.len() + 8 + prev.size(), Ordering::Relaxed);
                self.history.insert(history_key, prev);
            }
        }
        self.vals.insert((key.clone(), step), value.clone());
        self.latest.insert(key, value);
        self.size_bytes.fetch_add(entry_size, Ordering::Relaxed);
    }

    /// Latest buffered value of `key`
    pub fn latest(&self, key: &[u8]) -> Option<Value> {
        self.latest.get(key).map(|entry| entry.value().clone())
    }

    /// Number of buffered `(key, step)` rows
    pub fn len(&self) -> usize {
        self.vals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vals.is_empty() && self.history.is_empty()
    }

    /// Approximate size in bytes
    pub fn size(&self) -> usize {
        self.size_bytes.load(Ordering::Relaxed)
    }
}

/// A rotated-out buffer waiting to be written to the hot store
pub struct FlushBatch {
    buffer: WriteBuffer,
    config: Arc<DomainConfig>,
}

impl FlushBatch {
    pub(crate) fn new(buffer: WriteBuffer, config: Arc<DomainConfig>) -> Self {
        Self { buffer, config }
    }

    /// Number of buffered `(key, step)` rows
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the batch holds no rows
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Write every buffered row into `tx`
    pub fn flush<T: RwTx + ?Sized>(self, tx: &mut T) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let tables = &self.config.tables;

        for entry in self.buffer.vals.iter() {
            let (key, step) = entry.key();
            let inverted = encode_inverted_step(*step);
            tx.put(&tables.keys, key, &inverted)?;
            tx.put(&tables.vals, &key_with_suffix(key, !*step), &entry.value().encode())?;
        }

        if self.config.with_history {
            for entry in self.buffer.history.iter() {
                let (tx_num, key) = entry.key();
                let history_key = key_with_suffix(key, *tx_num);
                // an earlier batch may already hold the value before this txNum
                if tx.get(&tables.history_vals, &history_key)?.is_some() {
                    continue;
                }
                tx.put(&tables.history_keys, &encode_tx_num(*tx_num), key)?;
                tx.put(&tables.history_vals, &history_key, &entry.value().encode())?;
                tx.put(&tables.index, key, &encode_tx_num(*tx_num))?;
            }
        }

        debug!(
            "Flushed {} value rows and {} history rows ({} bytes) for {}",
            self.buffer.vals.len(),
            self.buffer.history.len(),
            self.buffer.size(),
            self.config.filename_base
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{MemDb, Tx};
    use crate::{decode_inverted_step, Value};

    #[test]
    fn test_buffer_keeps_first_prev_and_last_value() {
        let buffer = WriteBuffer::new();
        buffer.put(b"key1".to_vec(), 0, 2, Value::present("a"), Some(Value::Deleted));
        buffer.put(b"key1".to_vec(), 0, 2, Value::present("b"), Some(Value::present("a")));
        buffer.put(b"key1".to_vec(), 1, 17, Value::present("c"), Some(Value::present("b")));

        assert_eq!(buffer.latest(b"key1"), Some(Value::present("c")));
        assert_eq!(buffer.latest(b"key2"), None);
        assert_eq!(buffer.len(), 2);
        assert_eq!(
            *buffer.history.get(&(2, b"key1".to_vec())).unwrap().value(),
            Value::Deleted
        );
        assert!(buffer.size() > 0);
    }

    #[test]
    fn test_flush_writes_hot_tables() {
        let config = Arc::new(DomainConfig::default());
        let db = MemDb::new(config.tables.table_config());

        let buffer = WriteBuffer::new();
        buffer.put(b"key1".to_vec(), 0, 2, Value::present("a"), Some(Value::Deleted));
        buffer.put(b"key1".to_vec(), 0, 6, Value::Deleted, Some(Value::present("a")));

        let mut tx = db.begin_rw();
        FlushBatch::new(buffer, Arc::clone(&config)).flush(&mut tx).unwrap();
        tx.commit();

        let tx = db.begin_ro();
        let tables = &config.tables;
        let step = tx.get(&tables.keys, b"key1").unwrap().unwrap();
        assert_eq!(decode_inverted_step(&step).unwrap(), 0);
        let val = tx.get(&tables.vals, &key_with_suffix(b"key1", !0)).unwrap().unwrap();
        assert_eq!(Value::decode(&val).unwrap(), Value::Deleted);
        assert_eq!(tx.get_dups(&tables.index, b"key1").unwrap().len(), 2);
        let prev = tx
            .get(&tables.history_vals, &key_with_suffix(b"key1", 6))
            .unwrap()
            .unwrap();
        assert_eq!(Value::decode(&prev).unwrap(), Value::present("a"));
    }
}
