//! Per-key sets of change transaction numbers

use crate::seg::{get_uvarint, put_uvarint};
use crate::{Result, StrataError, TxNum};
use std::collections::BTreeMap;

/// Key -> ascending txNums at which the key changed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InvertedIndex {
    bitmaps: BTreeMap<Vec<u8>, Vec<TxNum>>,
}

impl InvertedIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a change of `key` at `tx_num`
    pub fn add(&mut self, key: &[u8], tx_num: TxNum) {
        let list = self.bitmaps.entry(key.to_vec()).or_default();
        match list.last() {
            Some(&last) if last == tx_num => {}
            Some(&last) if last > tx_num => {
                if let Err(pos) = list.binary_search(&tx_num) {
                    list.insert(pos, tx_num);
                }
            }
            _ => list.push(tx_num),
        }
    }

    /// Merge a whole sorted list for `key`
    pub fn extend(&mut self, key: &[u8], tx_nums: &[TxNum]) {
        for &tx_num in tx_nums {
            self.add(key, tx_num);
        }
    }

    /// Change list of `key`
    pub fn get(&self, key: &[u8]) -> Option<&[TxNum]> {
        self.bitmaps.get(key).map(Vec::as_slice)
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.bitmaps.len()
    }

    /// Check if no key was recorded
    pub fn is_empty(&self) -> bool {
        self.bitmaps.is_empty()
    }

    /// Keys in ascending order with their change lists
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[TxNum])> {
        self.bitmaps.iter().map(|(k, v)| (k.as_slice(), v.as_slice()))
    }
}

/// Encode an ascending txNum list as a count followed by varint deltas
pub fn encode_tx_nums(tx_nums: &[TxNum]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(tx_nums.len() * 2 + 1);
    put_uvarint(&mut buf, tx_nums.len() as u64);
    let mut prev = 0;
    for &tx_num in tx_nums {
        put_uvarint(&mut buf, tx_num - prev);
        prev = tx_num;
    }
    buf
}

/// Decode a list written by [`encode_tx_nums`]
pub fn decode_tx_nums(data: &[u8]) -> Result<Vec<TxNum>> {
    let (count, mut pos) = get_uvarint(data)?;
    let mut tx_nums = Vec::with_capacity(count.min(1 << 20) as usize);
    let mut prev: TxNum = 0;
    for _ in 0..count {
        let (delta, n) = get_uvarint(&data[pos..])?;
        pos += n;
        prev = prev.checked_add(delta).ok_or_else(|| {
            StrataError::Corruption("txNum list overflows u64".into())
        })?;
        tx_nums.push(prev);
    }
    if pos != data.len() {
        return Err(StrataError::Corruption(format!(
            "txNum list has {} trailing bytes",
            data.len() - pos
        )));
    }
    Ok(tx_nums)
}

/// First txNum in `tx_nums` that is `>= tx_num`
pub fn seek(tx_nums: &[TxNum], tx_num: TxNum) -> Option<TxNum> {
    let pos = tx_nums.partition_point(|&t| t < tx_num);
    tx_nums.get(pos).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_keeps_lists_sorted_and_unique() {
        let mut ii = InvertedIndex::new();
        ii.add(b"key1", 6);
        ii.add(b"key1", 2);
        ii.add(b"key1", 6);
        ii.add(b"key2", 3);
        ii.extend(b"key1", &[4, 9]);

        assert_eq!(ii.len(), 2);
        assert_eq!(ii.get(b"key1"), Some(&[2, 4, 6, 9][..]));
        assert_eq!(ii.get(b"key2"), Some(&[3][..]));
        assert_eq!(ii.get(b"key3"), None);

        let keys: Vec<_> = ii.iter().map(|(k, _)| k.to_vec()).collect();
        assert_eq!(keys, vec![b"key1".to_vec(), b"key2".to_vec()]);
    }

    #[test]
    fn test_tx_num_list_encoding() {
        let list = vec![0, 1, 16, 17, 1_000_000, u64::MAX];
        assert_eq!(decode_tx_nums(&encode_tx_nums(&list)).unwrap(), list);
        assert!(decode_tx_nums(&encode_tx_nums(&[])).unwrap().is_empty());

        let mut bad = encode_tx_nums(&[1, 2]);
        bad.push(0);
        assert!(decode_tx_nums(&bad).is_err());
    }

    #[test]
    fn test_seek() {
        let list = [2, 6, 17];
        assert_eq!(seek(&list, 0), Some(2));
        assert_eq!(seek(&list, 6), Some(6));
        assert_eq!(seek(&list, 7), Some(17));
        assert_eq!(seek(&list, 18), None);
    }
}
