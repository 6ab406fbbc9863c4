// resultspool - bounded-memory record spooler
// Buffers query results in memory and overflows to disk once a budget is exceeded

#![warn(rust_2018_idioms)]

pub mod config;
pub mod memory;
pub mod metrics;
pub mod source;
pub mod spool;

// Re-exports for convenience
pub use config::SpoolConfig;
pub use memory::{GlobalMemoryManager, MemoryChunk, MemoryManager};
pub use source::{IterSource, ReaderSource, RecordSource};
pub use spool::{
    PeekingRecordIterator, SpoolBuilder, SpoolOptions, SpoolingIterator, SpoolingIteratorFactory,
};

/// Spooler error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Insufficient memory: requested at least {requested} bytes, {available} available")]
        ResourceExhausted { requested: usize, available: usize },

        #[error("Result too big, max allowed (bytes): {max_bytes}")]
        SpoolCapacityExceeded { max_bytes: u64 },

        #[error("Truncated record: expected {expected} bytes, only {available} available")]
        TruncatedRecord { expected: usize, available: usize },

        #[error("Malformed length prefix: {0}")]
        MalformedLength(String),

        #[error("Source error: {0}")]
        Source(String),

        #[error("Storage error: {0}")]
        Storage(String),

        #[error("Configuration error: {0}")]
        Config(String),

        #[error("Invalid argument: {0}")]
        InvalidArgument(String),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
