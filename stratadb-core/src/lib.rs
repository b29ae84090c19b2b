//! StrataDB Core - Versioned Key-Value Storage Engine
//!
//! An embedded store that keeps the latest value of every key, enough history
//! to answer "what was the value just before transaction N", and compacts
//! accumulated writes into immutable, indexed shard files.
//!
//! # Architecture
//!
//! - **Hot store** ([`kv`]): transactional tables buffering writes that are
//!   not yet collated
//! - **Domain** ([`domain`]): write buffer, collation into shard files,
//!   merging, pruning, unwind and point-in-time read contexts
//! - **Word files** ([`seg`]): sequential compressed files of byte words
//! - **Perfect-hash indexes** ([`recsplit`]): key to byte-offset lookup over
//!   a shard's exact key set

pub mod domain;
pub mod kv;
pub mod recsplit;
pub mod seg;

mod error;
mod types;

pub use error::{Result, StrataError};
pub use types::*;

/// StrataDB version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Transaction numbers per aggregation step
    pub const DEFAULT_AGGREGATION_STEP: u64 = 3_125_000;

    /// Widest shard a merge may produce, in steps
    pub const STEPS_IN_BIGGEST_FILE: u64 = 32;

    /// Words shorter than this are stored uncompressed
    pub const COMPRESS_MIN_LEN: usize = 64;
}
