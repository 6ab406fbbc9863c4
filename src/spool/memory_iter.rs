//! Replay of records that never left memory

use super::codec::decode_from_slice;
use super::iterator::PeekingRecordIterator;
use crate::error::{Error, Result};
use crate::memory::MemoryChunk;
use std::ops::Range;

/// Replays records straight out of the retained spool buffer
///
/// Owns the buffer and the memory chunk accounting for it; the chunk is
/// released on close or drop.
#[derive(Debug)]
pub struct InMemoryRecordIterator {
    bytes: Vec<u8>,
    chunk: MemoryChunk,
    /// Payload range of the record returned by the next `peek`/`next`
    current: Option<Range<usize>>,
    /// Offset of the record after `current`
    offset: usize,
    /// Decode failure found while reading ahead, reported after the record
    /// before it has been returned
    pending_error: Option<Error>,
}

impl InMemoryRecordIterator {
    pub fn new(bytes: Vec<u8>, chunk: MemoryChunk) -> Result<Self> {
        let mut iter = Self {
            bytes,
            chunk,
            current: None,
            offset: 0,
            pending_error: None,
        };
        iter.advance()?;
        Ok(iter)
    }

    fn advance(&mut self) -> Result<()> {
        match decode_from_slice(&self.bytes, self.offset)? {
            Some((range, next_offset)) => {
                self.current = Some(range);
                self.offset = next_offset;
            }
            None => {
                self.current = None;
                self.offset = self.bytes.len();
            }
        }
        Ok(())
    }

    /// Bytes reserved for this iterator (zero once closed)
    pub fn reserved_bytes(&self) -> usize {
        self.chunk.size()
    }
}

impl PeekingRecordIterator for InMemoryRecordIterator {
    fn peek(&mut self) -> Result<Option<&[u8]>> {
        if let Some(e) = self.pending_error.take() {
            return Err(e);
        }
        Ok(self.current.clone().map(|range| &self.bytes[range]))
    }

    fn next(&mut self) -> Result<Option<&[u8]>> {
        if let Some(e) = self.pending_error.take() {
            return Err(e);
        }
        let current = match self.current.take() {
            Some(range) => range,
            None => return Ok(None),
        };
        if let Err(e) = self.advance() {
            self.current = None;
            self.offset = self.bytes.len();
            self.pending_error = Some(e);
        }
        Ok(Some(&self.bytes[current]))
    }

    fn close(&mut self) -> Result<()> {
        self.pending_error = None;
        self.chunk.release();
        self.current = None;
        self.offset = self.bytes.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::memory::{GlobalMemoryManager, MemoryManager};
    use crate::spool::codec::encode;
    use std::time::Duration;

    fn encode_all(records: &[&[u8]]) -> Vec<u8> {
        let mut buf = Vec::new();
        for record in records {
            encode(record, &mut buf).unwrap();
        }
        buf
    }

    #[test]
    fn test_replay_in_order() -> Result<()> {
        let manager = GlobalMemoryManager::unbounded();
        let bytes = encode_all(&[b"one", b"two", b"three"]);
        let mut iter = InMemoryRecordIterator::new(bytes, manager.allocate(0, 64)?)?;

        assert_eq!(iter.next()?, Some(&b"one"[..]));
        assert_eq!(iter.next()?, Some(&b"two"[..]));
        assert_eq!(iter.next()?, Some(&b"three"[..]));
        assert_eq!(iter.next()?, None);
        assert_eq!(iter.next()?, None);
        assert_eq!(iter.peek()?, None);
        Ok(())
    }

    #[test]
    fn test_peek_is_idempotent() -> Result<()> {
        let manager = GlobalMemoryManager::unbounded();
        let bytes = encode_all(&[b"a", b"b"]);
        let mut iter = InMemoryRecordIterator::new(bytes, manager.allocate(0, 64)?)?;

        assert_eq!(iter.peek()?, Some(&b"a"[..]));
        assert_eq!(iter.peek()?, Some(&b"a"[..]));
        assert_eq!(iter.next()?, Some(&b"a"[..]));
        assert_eq!(iter.peek()?, Some(&b"b"[..]));
        assert_eq!(iter.next()?, Some(&b"b"[..]));
        assert_eq!(iter.peek()?, None);
        Ok(())
    }

    #[test]
    fn test_empty_buffer() -> Result<()> {
        let manager = GlobalMemoryManager::unbounded();
        let mut iter = InMemoryRecordIterator::new(Vec::new(), manager.allocate(0, 0)?)?;
        assert_eq!(iter.peek()?, None);
        assert_eq!(iter.next()?, None);
        Ok(())
    }

    #[test]
    fn test_close_releases_once() -> Result<()> {
        let manager = GlobalMemoryManager::new(100, Duration::ZERO);
        let bytes = encode_all(&[b"payload"]);
        let mut chunk = manager.allocate(0, 100)?;
        chunk.resize(bytes.len())?;
        let mut iter = InMemoryRecordIterator::new(bytes, chunk)?;
        assert_eq!(manager.used_memory(), 8);

        iter.close()?;
        assert_eq!(manager.used_memory(), 0);
        iter.close()?;
        assert_eq!(manager.used_memory(), 0);
        assert_eq!(iter.next()?, None);

        // Memory is available to others again
        let other = manager.allocate(100, 100)?;
        assert_eq!(other.size(), 100);
        Ok(())
    }

    #[test]
    fn test_corrupt_buffer_is_reported() -> Result<()> {
        let manager = GlobalMemoryManager::unbounded();
        let mut bytes = encode_all(&[b"good"]);
        bytes.extend_from_slice(&[9, b'x']);

        let mut iter = InMemoryRecordIterator::new(bytes, manager.allocate(0, 64)?)?;
        assert_eq!(iter.peek()?, Some(&b"good"[..]));
        // The intact record comes out before the damage is reported
        assert_eq!(iter.next()?, Some(&b"good"[..]));
        assert!(matches!(
            iter.next(),
            Err(Error::TruncatedRecord {
                expected: 9,
                available: 1
            })
        ));
        assert_eq!(iter.next()?, None);
        assert_eq!(iter.peek()?, None);
        Ok(())
    }

    #[test]
    fn test_corruption_reported_by_peek() -> Result<()> {
        let manager = GlobalMemoryManager::unbounded();
        let mut bytes = encode_all(&[b"first", b"second"]);
        bytes.push(0x80);

        let mut iter = InMemoryRecordIterator::new(bytes, manager.allocate(0, 64)?)?;
        assert_eq!(iter.next()?, Some(&b"first"[..]));
        assert_eq!(iter.next()?, Some(&b"second"[..]));
        assert!(iter.peek().is_err());
        assert_eq!(iter.peek()?, None);
        assert_eq!(iter.next()?, None);
        Ok(())
    }
}
