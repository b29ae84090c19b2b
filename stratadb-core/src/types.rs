//! Core types for StrataDB

use crate::{Result, StrataError};
use std::fmt;

/// Transaction number: the ordering axis for history
pub type TxNum = u64;

/// Aggregation step index (`tx_num / aggregation_step`)
pub type Step = u64;

const TAG_DELETED: u8 = 0x00;
const TAG_PRESENT: u8 = 0x01;

/// A stored value: either bytes (possibly empty) or a delete tombstone.
///
/// Absence is expressed as `Option<Value>::None` by callers, so "was deleted",
/// "was set to empty" and "never written" stay distinguishable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    /// Key holds these bytes
    Present(Vec<u8>),
    /// Key was deleted
    Deleted,
}

impl Value {
    /// Build a present value
    pub fn present(bytes: impl Into<Vec<u8>>) -> Self {
        Value::Present(bytes.into())
    }

    /// Check for a tombstone
    pub fn is_deleted(&self) -> bool {
        matches!(self, Value::Deleted)
    }

    /// Borrow the bytes of a present value
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Present(v) => Some(v),
            Value::Deleted => None,
        }
    }

    /// Take the bytes of a present value
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Value::Present(v) => Some(v),
            Value::Deleted => None,
        }
    }

    /// Approximate size in bytes
    pub fn size(&self) -> usize {
        match self {
            Value::Present(v) => 1 + v.len(),
            Value::Deleted => 1,
        }
    }

    /// Encode with a one-byte tag for storage in the hot store
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Value::Present(v) => {
                let mut buf = Vec::with_capacity(v.len() + 1);
                buf.push(TAG_PRESENT);
                buf.extend_from_slice(v);
                buf
            }
            Value::Deleted => vec![TAG_DELETED],
        }
    }

    /// Decode a tagged value from the hot store
    pub fn decode(data: &[u8]) -> Result<Self> {
        match data.split_first() {
            Some((&TAG_PRESENT, rest)) => Ok(Value::Present(rest.to_vec())),
            Some((&TAG_DELETED, [])) => Ok(Value::Deleted),
            Some((tag, _)) => Err(StrataError::InvalidFormat(format!(
                "Invalid value tag: {}",
                tag
            ))),
            None => Err(StrataError::InvalidFormat("Empty tagged value".into())),
        }
    }

    /// Build from a word read out of a shard file (nil word = tombstone)
    pub fn from_word(word: Option<Vec<u8>>) -> Self {
        match word {
            Some(v) => Value::Present(v),
            None => Value::Deleted,
        }
    }
}

impl From<Option<Vec<u8>>> for Value {
    fn from(v: Option<Vec<u8>>) -> Self {
        Value::from_word(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Present(v) => write!(f, "{}", String::from_utf8_lossy(v)),
            Value::Deleted => write!(f, "<deleted>"),
        }
    }
}

/// Concatenate a primary key and an optional sub-key
pub fn compose_key(key: &[u8], subkey: &[u8]) -> Vec<u8> {
    let mut full = Vec::with_capacity(key.len() + subkey.len());
    full.extend_from_slice(key);
    full.extend_from_slice(subkey);
    full
}

/// Step encoded so that larger steps sort first
pub fn encode_inverted_step(step: Step) -> [u8; 8] {
    (!step).to_be_bytes()
}

/// Decode a step written by [`encode_inverted_step`]
pub fn decode_inverted_step(data: &[u8]) -> Result<Step> {
    Ok(!decode_u64(data)?)
}

/// Big-endian transaction number
pub fn encode_tx_num(tx_num: TxNum) -> [u8; 8] {
    tx_num.to_be_bytes()
}

/// Decode a big-endian transaction number
pub fn decode_tx_num(data: &[u8]) -> Result<TxNum> {
    decode_u64(data)
}

/// `key ++ big-endian suffix`, the layout used for versioned rows
pub fn key_with_suffix(key: &[u8], suffix: u64) -> Vec<u8> {
    let mut full = Vec::with_capacity(key.len() + 8);
    full.extend_from_slice(key);
    full.extend_from_slice(&suffix.to_be_bytes());
    full
}

/// Split a row written by [`key_with_suffix`]
pub fn split_key_suffix(data: &[u8]) -> Result<(&[u8], u64)> {
    if data.len() < 8 {
        return Err(StrataError::InvalidFormat(format!(
            "Versioned key too short: {} bytes",
            data.len()
        )));
    }
    let (key, suffix) = data.split_at(data.len() - 8);
    Ok((key, decode_u64(suffix)?))
}

fn decode_u64(data: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = data
        .try_into()
        .map_err(|_| StrataError::InvalidFormat(format!("Expected 8 bytes, got {}", data.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_tagging() {
        let empty = Value::present(Vec::new());
        assert_eq!(Value::decode(&empty.encode()).unwrap(), empty);
        assert_ne!(empty.encode(), Value::Deleted.encode());
        assert!(Value::decode(&[]).is_err());
        assert!(Value::decode(&[7, 1]).is_err());
    }

    #[test]
    fn test_inverted_step_order() {
        assert!(encode_inverted_step(5) < encode_inverted_step(4));
        assert_eq!(decode_inverted_step(&encode_inverted_step(42)).unwrap(), 42);
    }

    #[test]
    fn test_key_suffix_split() {
        let full = key_with_suffix(b"addr", 17);
        let (key, suffix) = split_key_suffix(&full).unwrap();
        assert_eq!(key, b"addr");
        assert_eq!(suffix, 17);
        assert!(split_key_suffix(b"short").is_err());
    }
}
