//! Drains an upstream source into a spill buffer and builds the replay iterator

use super::buffer::{Materialized, SpillBuffer};
use super::codec;
use super::disk_iter::OnDiskRecordIterator;
use super::file::SpoolFile;
use super::iterator::SpoolingIterator;
use super::memory_iter::InMemoryRecordIterator;
use crate::error::{Error, Result};
use crate::memory::{MemoryChunk, MemoryManager};
use crate::metrics::{BYTES_SPOOLED, SPOOL_FAILURES};
use crate::source::RecordSource;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Default in-memory threshold (20 MB)
pub const DEFAULT_SPOOL_THRESHOLD_BYTES: usize = 20 * 1024 * 1024;

/// Default extra bytes allowed on disk past the threshold
pub const DEFAULT_MAX_SPOOL_TO_DISK_BYTES: u64 = 1_024_000_000;

/// Limits for one spooling operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpoolOptions {
    /// Bytes requested from the memory manager before overflowing to disk
    pub threshold_bytes: usize,
    /// Extra bytes allowed on disk beyond the threshold (`None` = no cap)
    pub max_spool_to_disk_bytes: Option<u64>,
    /// Directory for spool files
    pub spool_directory: PathBuf,
}

impl SpoolOptions {
    pub fn new<P: Into<PathBuf>>(
        threshold_bytes: usize,
        max_spool_to_disk_bytes: Option<u64>,
        spool_directory: P,
    ) -> Self {
        Self {
            threshold_bytes,
            max_spool_to_disk_bytes,
            spool_directory: spool_directory.into(),
        }
    }

    /// Hard limit on total encoded bytes, if any
    pub fn max_bytes_allowed(&self) -> Option<u64> {
        self.max_spool_to_disk_bytes
            .map(|extra| (self.threshold_bytes as u64).saturating_add(extra))
    }
}

impl Default for SpoolOptions {
    fn default() -> Self {
        Self {
            threshold_bytes: DEFAULT_SPOOL_THRESHOLD_BYTES,
            max_spool_to_disk_bytes: Some(DEFAULT_MAX_SPOOL_TO_DISK_BYTES),
            spool_directory: std::env::temp_dir(),
        }
    }
}

/// Builds a [`SpoolingIterator`] from a record source
///
/// The source is always closed exactly once, and nothing acquired while
/// spooling outlives a failed build.
pub struct SpoolBuilder<'a> {
    memory_manager: &'a dyn MemoryManager,
    options: SpoolOptions,
}

impl<'a> SpoolBuilder<'a> {
    pub fn new(memory_manager: &'a dyn MemoryManager, options: SpoolOptions) -> Self {
        Self {
            memory_manager,
            options,
        }
    }

    pub fn options(&self) -> &SpoolOptions {
        &self.options
    }

    /// Spool every record of `source` and return an iterator replaying them
    pub fn build<S: RecordSource>(&self, mut source: S) -> Result<SpoolingIterator> {
        let result = self.spool(&mut source);
        if let Err(e) = &result {
            SPOOL_FAILURES.with_label_values(&[failure_reason(e)]).inc();
            warn!(error = %e, "Spooling failed");
        }
        result
    }

    fn spool<S: RecordSource>(&self, source: &mut S) -> Result<SpoolingIterator> {
        let chunk = match self.memory_manager.allocate(0, self.options.threshold_bytes) {
            Ok(chunk) => chunk,
            Err(e) => {
                close_source(source);
                return Err(e);
            }
        };

        // Created up front so it exists whether or not the spill happens
        let spool_file = match SpoolFile::create(&self.options.spool_directory) {
            Ok(file) => file,
            Err(e) => {
                close_source(source);
                release_chunk(Some(chunk));
                return Err(e);
            }
        };

        let threshold = chunk.size();
        let mut buffer = SpillBuffer::new(threshold, chunk, spool_file);
        let drained = self.drain(source, &mut buffer);
        let closed = source.close();

        let (records, max_record_size) = match (drained, closed) {
            (Ok(stats), Ok(())) => stats,
            (Err(e), closed) => {
                if let Err(close_err) = closed {
                    warn!("Failed to close record source: {}", close_err);
                }
                abandon(buffer);
                return Err(e);
            }
            (Ok(_), Err(e)) => {
                abandon(buffer);
                return Err(e);
            }
        };

        let bytes_written = buffer.bytes_written();
        let iterator = match buffer.finish()? {
            Materialized::InMemory {
                bytes,
                mut chunk,
                spool_file,
            } => {
                delete_spool_file(spool_file);
                chunk.resize(bytes.len())?;
                SpoolingIterator::InMemory(InMemoryRecordIterator::new(bytes, chunk)?)
            }
            Materialized::OnDisk { spool_file } => {
                SpoolingIterator::OnDisk(OnDiskRecordIterator::new(spool_file, max_record_size))
            }
        };

        debug!(
            records,
            bytes_written,
            max_record_size,
            in_memory = iterator.is_in_memory(),
            "Spooling complete"
        );
        Ok(iterator)
    }

    /// Pull records until the source runs dry
    ///
    /// Returns the record count and the largest encoded record size.
    fn drain<S: RecordSource>(
        &self,
        source: &mut S,
        buffer: &mut SpillBuffer,
    ) -> Result<(u64, usize)> {
        let max_bytes_allowed = self.options.max_bytes_allowed();
        let mut bytes_written = 0u64;
        let mut max_record_size = 0usize;
        let mut records = 0u64;

        while let Some(record) = source.next()? {
            let length = codec::encoded_len(record.len());
            if let Some(max_bytes) = max_bytes_allowed {
                if bytes_written + length as u64 > max_bytes {
                    return Err(Error::SpoolCapacityExceeded { max_bytes });
                }
            }

            codec::encode(&record, buffer)?;
            bytes_written += length as u64;
            BYTES_SPOOLED.inc_by(length as u64);
            max_record_size = max_record_size.max(length);
            records += 1;
        }

        Ok((records, max_record_size))
    }
}

impl SpoolingIterator {
    /// Spool `source` under `options`, reserving memory from `memory_manager`
    pub fn spool<S: RecordSource>(
        source: S,
        memory_manager: &dyn MemoryManager,
        options: SpoolOptions,
    ) -> Result<Self> {
        SpoolBuilder::new(memory_manager, options).build(source)
    }
}

fn close_source<S: RecordSource>(source: &mut S) {
    if let Err(e) = source.close() {
        warn!("Failed to close record source: {}", e);
    }
}

fn delete_spool_file(spool_file: SpoolFile) {
    if let Err(e) = spool_file.delete() {
        warn!("{}", e);
    }
}

fn release_chunk(chunk: Option<MemoryChunk>) {
    if let Some(mut chunk) = chunk {
        chunk.release();
    }
}

/// Delete the spool file, then release the reservation
fn abandon(buffer: SpillBuffer) {
    let (chunk, spool_file) = buffer.abandon();
    delete_spool_file(spool_file);
    release_chunk(chunk);
}

fn failure_reason(error: &Error) -> &'static str {
    match error {
        Error::ResourceExhausted { .. } => "memory",
        Error::SpoolCapacityExceeded { .. } => "capacity",
        Error::TruncatedRecord { .. } | Error::MalformedLength(_) => "corrupt",
        Error::Source(_) => "source",
        Error::Storage(_) => "storage",
        Error::Config(_) | Error::InvalidArgument(_) => "invalid",
    }
}
