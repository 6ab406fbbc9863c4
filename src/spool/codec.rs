//! Record wire format
//!
//! Each record is written as an unsigned LEB128 length followed by the raw
//! bytes:
//!
//! ```text
//! [varint len][len bytes][varint len][len bytes]...
//! ```
//!
//! No header, footer or checksum. The format only lives as long as a single
//! spool file and is not meant to be read by anything else.

use crate::error::{Error, Result};
use std::io::{ErrorKind, Read, Write};
use std::ops::Range;

/// Longest valid prefix for a `u64` length
pub const MAX_VARINT_LEN: usize = 10;

/// Number of bytes needed to encode `value` as a varint
pub fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Total encoded size of a record with `record_len` payload bytes
pub fn encoded_len(record_len: usize) -> usize {
    varint_len(record_len as u64) + record_len
}

/// Write `value` as a minimal varint, returning the number of bytes written
pub fn write_varint<W: Write + ?Sized>(sink: &mut W, mut value: u64) -> Result<usize> {
    let mut buf = [0u8; MAX_VARINT_LEN];
    let mut len = 0;
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf[len] = byte;
            len += 1;
            break;
        }
        buf[len] = byte | 0x80;
        len += 1;
    }
    sink.write_all(&buf[..len])
        .map_err(|e| Error::Storage(format!("Failed to write length prefix: {}", e)))?;
    Ok(len)
}

/// Encode one record into `sink`
///
/// Returns the total number of bytes written (prefix + payload).
pub fn encode<W: Write + ?Sized>(record: &[u8], sink: &mut W) -> Result<usize> {
    let prefix = write_varint(sink, record.len() as u64)?;
    sink.write_all(record)
        .map_err(|e| Error::Storage(format!("Failed to write record: {}", e)))?;
    Ok(prefix + record.len())
}

fn length_to_usize(value: u64) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| Error::MalformedLength(format!("length {} does not fit in memory", value)))
}

/// Accumulates varint bytes and reports overflow
struct VarintDecoder {
    value: u64,
    shift: u32,
    consumed: usize,
}

impl VarintDecoder {
    fn new() -> Self {
        Self {
            value: 0,
            shift: 0,
            consumed: 0,
        }
    }

    /// Feed one byte; returns the value once the last byte has been seen
    fn push(&mut self, byte: u8) -> Result<Option<u64>> {
        self.consumed += 1;
        if self.consumed > MAX_VARINT_LEN {
            return Err(Error::MalformedLength(format!(
                "prefix longer than {} bytes",
                MAX_VARINT_LEN
            )));
        }

        let bits = u64::from(byte & 0x7f);
        if self.shift == 63 && bits > 1 {
            return Err(Error::MalformedLength("prefix overflows u64".to_string()));
        }
        self.value |= bits << self.shift;

        if byte & 0x80 == 0 {
            return Ok(Some(self.value));
        }
        self.shift += 7;
        Ok(None)
    }
}

/// Decode the record starting at `offset` in a retained buffer
///
/// Returns the payload range and the offset of the following record, or
/// `None` when `offset` is at the end of the buffer.
pub fn decode_from_slice(buf: &[u8], offset: usize) -> Result<Option<(Range<usize>, usize)>> {
    if offset >= buf.len() {
        return Ok(None);
    }

    let mut decoder = VarintDecoder::new();
    let mut pos = offset;
    let len = loop {
        let byte = *buf.get(pos).ok_or(Error::TruncatedRecord {
            expected: decoder.consumed + 1,
            available: decoder.consumed,
        })?;
        pos += 1;
        if let Some(value) = decoder.push(byte)? {
            break length_to_usize(value)?;
        }
    };

    let available = buf.len() - pos;
    if len > available {
        return Err(Error::TruncatedRecord {
            expected: len,
            available,
        });
    }
    Ok(Some((pos..pos + len, pos + len)))
}

/// Read a length prefix from a stream
///
/// Returns `None` if the stream is exhausted before the first prefix byte,
/// which marks a clean record boundary.
pub fn read_length<R: Read + ?Sized>(source: &mut R) -> Result<Option<usize>> {
    let mut decoder = VarintDecoder::new();
    let mut byte = [0u8; 1];
    loop {
        match source.read(&mut byte) {
            Ok(0) if decoder.consumed == 0 => return Ok(None),
            Ok(0) => {
                return Err(Error::TruncatedRecord {
                    expected: decoder.consumed + 1,
                    available: decoder.consumed,
                })
            }
            Ok(_) => {
                if let Some(value) = decoder.push(byte[0])? {
                    return length_to_usize(value).map(Some);
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Storage(format!("Failed to read length prefix: {}", e))),
        }
    }
}

/// Fill `buf` completely from `source`
///
/// Fails with [`Error::TruncatedRecord`] if the stream ends first.
pub fn read_payload<R: Read + ?Sized>(source: &mut R, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(Error::TruncatedRecord {
                    expected: buf.len(),
                    available: filled,
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Storage(format!("Failed to read record: {}", e))),
        }
    }
    Ok(())
}

/// Decode one record from a stream into an owned buffer
///
/// `Ok(None)` is the end-of-stream signal, not an error.
pub fn decode<R: Read + ?Sized>(source: &mut R) -> Result<Option<Vec<u8>>> {
    let len = match read_length(source)? {
        Some(len) => len,
        None => return Ok(None),
    };
    let mut record = vec![0u8; len];
    read_payload(source, &mut record)?;
    Ok(Some(record))
}
