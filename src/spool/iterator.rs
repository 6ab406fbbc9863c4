//! Peekable replay over spooled records

use super::disk_iter::OnDiskRecordIterator;
use super::memory_iter::InMemoryRecordIterator;
use crate::error::Result;

/// Forward-only record iterator with one record of lookahead
///
/// Returned slices borrow the iterator and stay valid until the next call.
/// `peek` may be called any number of times; `next` returns the record `peek`
/// would have returned and advances by one. `None` marks the end and is
/// returned again on every later call.
pub trait PeekingRecordIterator {
    fn peek(&mut self) -> Result<Option<&[u8]>>;

    fn next(&mut self) -> Result<Option<&[u8]>>;

    /// Release everything held by the iterator; safe to call more than once
    fn close(&mut self) -> Result<()>;

    /// Describe this step of a query plan
    fn explain(&self, _plan_steps: &mut Vec<String>) {}
}

/// Replay iterator produced by spooling, backed by memory or by disk
#[derive(Debug)]
pub enum SpoolingIterator {
    InMemory(InMemoryRecordIterator),
    OnDisk(OnDiskRecordIterator),
}

impl SpoolingIterator {
    pub fn is_in_memory(&self) -> bool {
        matches!(self, SpoolingIterator::InMemory(_))
    }

    /// Drain the remaining records into owned buffers, then close
    pub fn collect_all(&mut self) -> Result<Vec<Vec<u8>>> {
        let mut records = Vec::new();
        while let Some(record) = self.next()? {
            records.push(record.to_vec());
        }
        self.close()?;
        Ok(records)
    }
}

impl PeekingRecordIterator for SpoolingIterator {
    fn peek(&mut self) -> Result<Option<&[u8]>> {
        match self {
            SpoolingIterator::InMemory(iter) => iter.peek(),
            SpoolingIterator::OnDisk(iter) => iter.peek(),
        }
    }

    fn next(&mut self) -> Result<Option<&[u8]>> {
        match self {
            SpoolingIterator::InMemory(iter) => iter.next(),
            SpoolingIterator::OnDisk(iter) => iter.next(),
        }
    }

    fn close(&mut self) -> Result<()> {
        match self {
            SpoolingIterator::InMemory(iter) => iter.close(),
            SpoolingIterator::OnDisk(iter) => iter.close(),
        }
    }

    fn explain(&self, plan_steps: &mut Vec<String>) {
        match self {
            SpoolingIterator::InMemory(iter) => plan_steps.push(format!(
                "SPOOL IN MEMORY ({} bytes reserved)",
                iter.reserved_bytes()
            )),
            SpoolingIterator::OnDisk(iter) => plan_steps.push(format!(
                "SPOOL ON DISK (max record {} bytes)",
                iter.max_record_size()
            )),
        }
    }
}
