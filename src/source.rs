//! Upstream record sources
//!
//! The spooler pulls records from a [`RecordSource`] one at a time and closes
//! it exactly once, whatever the outcome of spooling.

use crate::error::{Error, Result};
use bytes::Bytes;
use std::io::BufRead;

/// Pull-based producer of opaque records
pub trait RecordSource {
    /// Next record, or `None` once the source is exhausted
    fn next(&mut self) -> Result<Option<Bytes>>;

    /// Release the source
    fn close(&mut self) -> Result<()>;
}

impl<S: RecordSource + ?Sized> RecordSource for Box<S> {
    fn next(&mut self) -> Result<Option<Bytes>> {
        (**self).next()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Source over any in-memory iterator of records
pub struct IterSource<I> {
    iter: Option<I>,
}

impl<I> IterSource<I>
where
    I: Iterator,
    I::Item: Into<Bytes>,
{
    pub fn new<T: IntoIterator<IntoIter = I>>(records: T) -> Self {
        Self {
            iter: Some(records.into_iter()),
        }
    }
}

impl<I> RecordSource for IterSource<I>
where
    I: Iterator,
    I::Item: Into<Bytes>,
{
    fn next(&mut self) -> Result<Option<Bytes>> {
        Ok(self.iter.as_mut().and_then(|it| it.next()).map(Into::into))
    }

    fn close(&mut self) -> Result<()> {
        self.iter = None;
        Ok(())
    }
}

/// Newline-delimited records read from a buffered reader
///
/// Line terminators (`\n` or `\r\n`) are stripped from each record.
pub struct ReaderSource<R> {
    reader: Option<R>,
    line: Vec<u8>,
}

impl<R: BufRead> ReaderSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: Some(reader),
            line: Vec::new(),
        }
    }
}

impl<R: BufRead> RecordSource for ReaderSource<R> {
    fn next(&mut self) -> Result<Option<Bytes>> {
        let reader = match self.reader.as_mut() {
            Some(reader) => reader,
            None => return Ok(None),
        };

        self.line.clear();
        let read = reader
            .read_until(b'\n', &mut self.line)
            .map_err(|e| Error::Source(format!("Failed to read record: {}", e)))?;
        if read == 0 {
            return Ok(None);
        }

        if self.line.last() == Some(&b'\n') {
            self.line.pop();
            if self.line.last() == Some(&b'\r') {
                self.line.pop();
            }
        }
        Ok(Some(Bytes::copy_from_slice(&self.line)))
    }

    fn close(&mut self) -> Result<()> {
        self.reader = None;
        Ok(())
    }
}
