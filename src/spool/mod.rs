//! Result spooling
//!
//! Drains a record source into memory, overflowing to a temp file once the
//! memory reservation is used up, and replays the records with one record of
//! lookahead.
//!
//! # Architecture
//!
//! ```text
//! RecordSource ──next()──→ SpoolBuilder ──encode──→ SpillBuffer
//!                                                   ├─→ InMemory { bytes, MemoryChunk }
//!                                                   └─→ OnDisk { SpoolFile }
//!                                                         │ finish()
//!                          SpoolingIterator ←─────────────┘
//!                            ├─→ InMemoryRecordIterator (offsets into bytes)
//!                            └─→ OnDiskRecordIterator   (two scratch buffers)
//! ```
//!
//! Ownership of the memory chunk and of the spool file moves along this
//! pipeline; neither is ever shared.

pub mod buffer;
pub mod builder;
pub mod codec;
pub mod disk_iter;
pub mod factory;
pub mod file;
pub mod iterator;
pub mod memory_iter;

pub use buffer::{Materialized, SpillBuffer};
pub use builder::{SpoolBuilder, SpoolOptions};
pub use disk_iter::OnDiskRecordIterator;
pub use factory::SpoolingIteratorFactory;
pub use file::SpoolFile;
pub use iterator::{PeekingRecordIterator, SpoolingIterator};
pub use memory_iter::InMemoryRecordIterator;
