//! Error types for StrataDB

use thiserror::Error;

/// Result type alias for StrataDB operations
pub type Result<T> = std::result::Result<T, StrataError>;

/// StrataDB error types
#[derive(Error, Debug)]
pub enum StrataError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Compression/decompression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Registered shard files disagree with each other
    #[error("Inconsistent files: {0}")]
    InconsistentFiles(String),

    /// Perfect-hash index could not be built over the key set
    #[error("Index build error: {0}")]
    IndexBuild(String),

    /// Writer tried to move the transaction number backwards
    #[error("txNum must not decrease: current {current}, requested {requested}")]
    TxNumDecreased { current: u64, requested: u64 },

    /// Unwind boundary lies inside data already persisted to shard files
    #[error("cannot unwind to txNum {tx_from}: shard files cover up to {files_end}")]
    UnwindIntoFiles { tx_from: u64, files_end: u64 },

    /// Prune requested for a range that shard files do not cover yet
    #[error("cannot prune up to txNum {tx_to}: shard files cover up to {files_end}")]
    PruneUncollated { tx_to: u64, files_end: u64 },

    /// Operation needs the write buffer flushed first
    #[error("write buffer holds unflushed writes")]
    UnflushedWrites,

    /// Historical read on a domain opened without history
    #[error("history is disabled for this domain")]
    HistoryDisabled,
}

impl StrataError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, StrataError::Io(_))
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StrataError::Corruption(_)
                | StrataError::ChecksumMismatch { .. }
                | StrataError::InvalidFormat(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let io = StrataError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert!(io.is_retryable());
        assert!(!io.is_corruption());

        let crc = StrataError::ChecksumMismatch { expected: 1, actual: 2 };
        assert!(crc.is_corruption());
        assert!(!crc.is_retryable());

        let msg = StrataError::TxNumDecreased { current: 7, requested: 3 }.to_string();
        assert!(msg.contains("current 7"));
    }
}
