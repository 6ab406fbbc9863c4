//! Spill buffer: in memory up to a threshold, then on disk
//!
//! ```text
//! InMemory { bytes, chunk } ──(write would exceed threshold)──→ OnDisk { writer }
//!                              copy bytes to file, release chunk
//! ```
//!
//! The transition happens at most once and never goes back. Callers just keep
//! writing; the buffer decides where the bytes live.

use super::file::SpoolFile;
use crate::error::{Error, Result};
use crate::memory::MemoryChunk;
use crate::metrics::SPILLS_TO_DISK;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use tracing::debug;

enum SpillState {
    InMemory { bytes: Vec<u8>, chunk: MemoryChunk },
    OnDisk { writer: BufWriter<File> },
}

/// Where the spooled bytes ended up
#[derive(Debug)]
pub enum Materialized {
    /// Everything fit under the threshold. `bytes` is trimmed to its length.
    /// The spool file was never written and should be deleted by the caller.
    InMemory {
        bytes: Vec<u8>,
        chunk: MemoryChunk,
        spool_file: SpoolFile,
    },
    /// Bytes live in the spool file; the memory chunk was already released.
    OnDisk { spool_file: SpoolFile },
}

/// Output sink that overflows from memory to a spool file
pub struct SpillBuffer {
    threshold: usize,
    written: u64,
    state: SpillState,
    spool_file: SpoolFile,
}

impl SpillBuffer {
    /// Create a buffer that keeps up to `threshold` bytes in memory
    ///
    /// `chunk` accounts for the in-memory bytes and is released as soon as the
    /// buffer moves to `spool_file`.
    pub fn new(threshold: usize, chunk: MemoryChunk, spool_file: SpoolFile) -> Self {
        Self {
            threshold,
            written: 0,
            state: SpillState::InMemory {
                bytes: Vec::new(),
                chunk,
            },
            spool_file,
        }
    }

    /// Append bytes, moving to disk first if they would not fit in memory
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        if let SpillState::InMemory { bytes, .. } = &self.state {
            if bytes.len() + data.len() > self.threshold {
                self.spill()?;
            }
        }

        match &mut self.state {
            SpillState::InMemory { bytes, .. } => {
                // Never let the allocation outgrow the reservation
                if bytes.capacity() - bytes.len() < data.len() {
                    let wanted = (bytes.len() * 2).max(bytes.len() + data.len());
                    bytes.reserve_exact(wanted.min(self.threshold) - bytes.len());
                }
                bytes.extend_from_slice(data);
            }
            SpillState::OnDisk { writer } => writer
                .write_all(data)
                .map_err(|e| Error::Storage(format!("Failed to write spool file: {}", e)))?,
        }
        self.written += data.len() as u64;
        Ok(())
    }

    fn spill(&mut self) -> Result<()> {
        let mut writer = BufWriter::new(self.spool_file.open_write()?);
        if let SpillState::InMemory { bytes, .. } = &self.state {
            writer
                .write_all(bytes)
                .map_err(|e| Error::Storage(format!("Failed to copy buffer to spool file: {}", e)))?;
        }

        let previous = std::mem::replace(&mut self.state, SpillState::OnDisk { writer });
        if let SpillState::InMemory { bytes, mut chunk } = previous {
            drop(bytes);
            chunk.release();
        }

        SPILLS_TO_DISK.inc();
        debug!(
            threshold = self.threshold,
            written = self.written,
            path = ?self.spool_file.path(),
            "Spill buffer moved to disk"
        );
        Ok(())
    }

    /// Whether all bytes are still held in memory
    pub fn is_in_memory(&self) -> bool {
        matches!(self.state, SpillState::InMemory { .. })
    }

    /// Total bytes appended so far
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Give up on the buffer, handing back the resources it holds
    ///
    /// The file writer is closed. The chunk is `None` if the buffer had
    /// already moved to disk.
    pub fn abandon(self) -> (Option<MemoryChunk>, SpoolFile) {
        let chunk = match self.state {
            SpillState::InMemory { chunk, .. } => Some(chunk),
            SpillState::OnDisk { .. } => None,
        };
        (chunk, self.spool_file)
    }

    /// Flush and hand back the bytes or the file holding them
    pub fn finish(self) -> Result<Materialized> {
        match self.state {
            SpillState::InMemory { mut bytes, chunk } => {
                bytes.shrink_to_fit();
                Ok(Materialized::InMemory {
                    bytes,
                    chunk,
                    spool_file: self.spool_file,
                })
            }
            SpillState::OnDisk { writer } => {
                let file = writer
                    .into_inner()
                    .map_err(|e| Error::Storage(format!("Failed to flush spool file: {}", e)))?;
                drop(file);
                Ok(Materialized::OnDisk {
                    spool_file: self.spool_file,
                })
            }
        }
    }
}

impl Write for SpillBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf).map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.state {
            SpillState::InMemory { .. } => Ok(()),
            SpillState::OnDisk { writer } => writer.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{GlobalMemoryManager, MemoryManager};
    use std::time::Duration;

    fn setup(name: &str, threshold: usize) -> Result<(GlobalMemoryManager, SpillBuffer, std::path::PathBuf)> {
        let temp_dir = std::env::temp_dir().join(format!("{}_{}", name, std::process::id()));
        let manager = GlobalMemoryManager::new(1024, Duration::ZERO);
        let chunk = manager.allocate(0, threshold)?;
        let file = SpoolFile::create(&temp_dir)?;
        let buffer = SpillBuffer::new(chunk.size(), chunk, file);
        Ok((manager, buffer, temp_dir))
    }

    #[test]
    fn test_stays_in_memory_at_threshold() -> Result<()> {
        let (manager, mut buffer, temp_dir) = setup("spill_exact", 10)?;

        buffer.append(b"12345")?;
        buffer.append(b"67890")?;
        assert!(buffer.is_in_memory());
        assert_eq!(buffer.bytes_written(), 10);
        assert_eq!(manager.used_memory(), 10);

        match buffer.finish()? {
            Materialized::InMemory {
                bytes,
                chunk,
                spool_file,
            } => {
                assert_eq!(bytes, b"1234567890");
                assert_eq!(chunk.size(), 10);
                // Never written to
                assert_eq!(std::fs::metadata(spool_file.path()).map(|m| m.len()).unwrap_or(1), 0);
                spool_file.delete()?;
            }
            Materialized::OnDisk { .. } => panic!("Expected in-memory result"),
        }

        std::fs::remove_dir_all(temp_dir).ok();
        Ok(())
    }

    #[test]
    fn test_capacity_stays_within_threshold() -> Result<()> {
        let (_manager, mut buffer, temp_dir) = setup("spill_capacity", 100)?;

        for _ in 0..65 {
            buffer.append(b"x")?;
            if let SpillState::InMemory { bytes, .. } = &buffer.state {
                assert!(bytes.capacity() <= 100);
            }
        }
        buffer.append(&[b'y'; 35])?;
        assert!(buffer.is_in_memory());
        if let SpillState::InMemory { bytes, .. } = &buffer.state {
            assert_eq!(bytes.capacity(), 100);
        }

        match buffer.finish()? {
            Materialized::InMemory {
                bytes, spool_file, ..
            } => {
                assert_eq!(bytes.len(), 100);
                assert!(bytes.capacity() <= 100);
                spool_file.delete()?;
            }
            Materialized::OnDisk { .. } => panic!("Expected in-memory result"),
        }

        std::fs::remove_dir_all(temp_dir).ok();
        Ok(())
    }

    #[test]
    fn test_finish_trims_allocation() -> Result<()> {
        let (_manager, mut buffer, temp_dir) = setup("spill_trim", 1000)?;
        for _ in 0..65 {
            buffer.append(b"z")?;
        }

        match buffer.finish()? {
            Materialized::InMemory {
                bytes, spool_file, ..
            } => {
                assert_eq!(bytes.len(), 65);
                assert_eq!(bytes.capacity(), 65);
                spool_file.delete()?;
            }
            Materialized::OnDisk { .. } => panic!("Expected in-memory result"),
        }

        std::fs::remove_dir_all(temp_dir).ok();
        Ok(())
    }

    #[test]
    fn test_spills_past_threshold() -> Result<()> {
        let (manager, mut buffer, temp_dir) = setup("spill_over", 10)?;

        buffer.append(b"12345678")?;
        assert!(buffer.is_in_memory());
        assert_eq!(manager.used_memory(), 10);

        buffer.append(b"abc")?;
        assert!(!buffer.is_in_memory());
        // Chunk released at the moment of the switch
        assert_eq!(manager.used_memory(), 0);

        buffer.append(b"xyz")?;
        assert_eq!(buffer.bytes_written(), 14);

        match buffer.finish()? {
            Materialized::OnDisk { spool_file } => {
                let contents = std::fs::read(spool_file.path())
                    .map_err(|e| Error::Storage(e.to_string()))?;
                assert_eq!(contents, b"12345678abcxyz");
            }
            Materialized::InMemory { .. } => panic!("Expected on-disk result"),
        }

        std::fs::remove_dir_all(temp_dir).ok();
        Ok(())
    }

    #[test]
    fn test_io_write_through_codec() -> Result<()> {
        let (_manager, mut buffer, temp_dir) = setup("spill_codec", 4)?;

        // Prefix goes to memory, payload forces the switch mid-record
        let written = super::super::codec::encode(b"abcdef", &mut buffer)?;
        assert_eq!(written, 7);
        assert!(!buffer.is_in_memory());

        match buffer.finish()? {
            Materialized::OnDisk { spool_file } => {
                let contents = std::fs::read(spool_file.path())
                    .map_err(|e| Error::Storage(e.to_string()))?;
                assert_eq!(contents, b"\x06abcdef");
            }
            Materialized::InMemory { .. } => panic!("Expected on-disk result"),
        }

        std::fs::remove_dir_all(temp_dir).ok();
        Ok(())
    }

    #[test]
    fn test_drop_cleans_up() -> Result<()> {
        let (manager, mut buffer, temp_dir) = setup("spill_drop", 4)?;
        buffer.append(b"123456")?;
        let path = buffer.spool_file.path().to_path_buf();
        assert!(path.exists());

        drop(buffer);
        assert!(!path.exists());
        assert_eq!(manager.used_memory(), 0);

        std::fs::remove_dir_all(temp_dir).ok();
        Ok(())
    }
}
