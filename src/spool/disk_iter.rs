//! Replay of records spooled to disk
//!
//! Records are read into two scratch buffers sized to the largest spooled
//! record and used alternately:
//!
//! ```text
//!            peek()/next() returns        read-ahead decodes into
//! step 0:    buffers[0] = rec#0           buffers[1] ← rec#1
//! step 1:    buffers[1] = rec#1           buffers[0] ← rec#2
//! ```
//!
//! so `next()` can hand out the record it peeked while the following one is
//! already being decoded, without copying and without growing allocations past
//! the largest record.

use super::codec::{read_length, read_payload};
use super::file::SpoolFile;
use super::iterator::PeekingRecordIterator;
use crate::error::{Error, Result};
use std::fs::File;
use std::io::BufReader;
use tracing::{debug, warn};

/// Replays records from a spool file
///
/// The file is opened on the first `peek`/`next`, and closed and deleted once
/// the records are exhausted, on `close`, or on drop. Exclusive access for
/// every operation comes from `&mut self`.
#[derive(Debug)]
pub struct OnDiskRecordIterator {
    spool_file: Option<SpoolFile>,
    max_record_size: usize,
    reader: Option<BufReader<File>>,
    buffers: [Vec<u8>; 2],
    buffer_index: usize,
    /// Length of the record held in `buffers[buffer_index]`
    current: Option<usize>,
    initialized: bool,
    closed: bool,
    /// Read-ahead failure, reported once the record before it was returned
    pending_error: Option<Error>,
}

impl OnDiskRecordIterator {
    pub fn new(spool_file: SpoolFile, max_record_size: usize) -> Self {
        Self {
            spool_file: Some(spool_file),
            max_record_size,
            reader: None,
            buffers: [Vec::new(), Vec::new()],
            buffer_index: 0,
            current: None,
            initialized: false,
            closed: false,
            pending_error: None,
        }
    }

    /// Size of each scratch buffer
    pub fn max_record_size(&self) -> usize {
        self.max_record_size
    }

    /// Whether the backing file has been released
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn init(&mut self) -> Result<()> {
        if self.initialized || self.closed {
            return Ok(());
        }
        self.initialized = true;

        let file = match self.spool_file.as_ref() {
            Some(spool_file) => spool_file.open_read(),
            None => Err(Error::Storage("Spool file already released".to_string())),
        };
        let file = match file {
            Ok(file) => file,
            Err(e) => {
                self.release_quietly();
                return Err(e);
            }
        };

        debug!(max_record_size = self.max_record_size, "Opening spool file for replay");
        self.reader = Some(BufReader::new(file));
        self.buffers = [vec![0u8; self.max_record_size], vec![0u8; self.max_record_size]];
        self.advance()
    }

    /// Decode the following record into the buffer not currently in use
    fn advance(&mut self) -> Result<()> {
        if self.closed {
            self.current = None;
            return Ok(());
        }

        match self.read_next() {
            Ok(Some((index, len))) => {
                self.buffer_index = index;
                self.current = Some(len);
                Ok(())
            }
            Ok(None) => self.reached_end(),
            Err(e) => {
                self.release_quietly();
                Err(e)
            }
        }
    }

    fn read_next(&mut self) -> Result<Option<(usize, usize)>> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| Error::Storage("Spool file is not open".to_string()))?;

        let len = match read_length(reader)? {
            Some(len) => len,
            None => return Ok(None),
        };
        if len > self.max_record_size {
            return Err(Error::MalformedLength(format!(
                "record of {} bytes exceeds largest spooled record ({} bytes)",
                len, self.max_record_size
            )));
        }

        let index = (self.buffer_index + 1) % 2;
        read_payload(reader, &mut self.buffers[index][..len])?;
        Ok(Some((index, len)))
    }

    /// Terminal state: close the reader and delete the spool file
    fn reached_end(&mut self) -> Result<()> {
        self.current = None;
        self.closed = true;
        self.reader = None;
        match self.spool_file.take() {
            Some(spool_file) => spool_file.delete(),
            None => Ok(()),
        }
    }

    fn release_quietly(&mut self) {
        if let Err(e) = self.reached_end() {
            warn!("Failed to release spool file after read error: {}", e);
        }
    }
}

impl PeekingRecordIterator for OnDiskRecordIterator {
    fn peek(&mut self) -> Result<Option<&[u8]>> {
        if let Some(e) = self.pending_error.take() {
            return Err(e);
        }
        self.init()?;
        Ok(self
            .current
            .map(|len| &self.buffers[self.buffer_index][..len]))
    }

    fn next(&mut self) -> Result<Option<&[u8]>> {
        if let Some(e) = self.pending_error.take() {
            return Err(e);
        }
        self.init()?;
        let len = match self.current {
            Some(len) => len,
            None => return Ok(None),
        };
        let index = self.buffer_index;
        // File is already released on failure; the buffers survive until close
        if let Err(e) = self.advance() {
            self.pending_error = Some(e);
        }
        Ok(Some(&self.buffers[index][..len]))
    }

    fn close(&mut self) -> Result<()> {
        self.pending_error = None;
        let result = if self.closed {
            Ok(())
        } else {
            self.reached_end()
        };
        self.buffers = [Vec::new(), Vec::new()];
        result
    }
}

impl Drop for OnDiskRecordIterator {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close spool file: {}", e);
        }
    }
}
