//! Chunked bulk-transfer reassembly.
//!
//! A transfer is announced by a text header line
//! `SCREEN_IMAGE:<width>:<height>:<byteSize>` riding a binary `Response`
//! frame, followed by raw payload chunks until `byteSize` bytes have
//! accumulated. This module only reassembles; interpreting the completed
//! buffer (BMP reconstruction etc.) belongs to the consumer.

use bytes::{Bytes, BytesMut};

use crate::constants::{BULK_HEADER_PREFIX, MAX_BULK_DIMENSION, MAX_FRAME_SIZE};
use crate::error::{Error, Result};

/// A fully reassembled bulk payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkImage {
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

/// Accumulator for one in-flight bulk transfer.
#[derive(Debug)]
pub struct BulkTransfer {
    width: u32,
    height: u32,
    expected: usize,
    buffer: BytesMut,
}

impl BulkTransfer {
    /// Parse a `SCREEN_IMAGE:<width>:<height>:<byteSize>` announcement.
    pub fn from_header(header: &str) -> Result<Self> {
        let parts: Vec<&str> = header.trim().split(':').collect();
        if parts.len() != 4 || parts[0] != BULK_HEADER_PREFIX {
            return Err(Error::framing(format!("invalid bulk header: {header:?}")));
        }

        let width = parse_field::<u32>(parts[1], "width")?;
        let height = parse_field::<u32>(parts[2], "height")?;
        let expected = parse_field::<usize>(parts[3], "size")?;

        if width == 0 || width > MAX_BULK_DIMENSION || height == 0 || height > MAX_BULK_DIMENSION
        {
            return Err(Error::framing(format!(
                "bulk dimensions {width}x{height} out of range"
            )));
        }
        if expected == 0 || expected > MAX_FRAME_SIZE {
            return Err(Error::framing(format!(
                "bulk size {expected} out of range (max {MAX_FRAME_SIZE})"
            )));
        }

        Ok(BulkTransfer {
            width,
            height,
            expected,
            buffer: BytesMut::with_capacity(expected),
        })
    }

    /// Returns true for payloads that announce a transfer.
    pub fn is_header(payload: &[u8]) -> bool {
        payload.starts_with(BULK_HEADER_PREFIX.as_bytes())
    }

    /// Append one raw chunk. Returns the completed image once `expected`
    /// bytes have accumulated; a chunk running past the announced size is a
    /// framing error.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Result<Option<BulkImage>> {
        if self.buffer.len() + chunk.len() > self.expected {
            return Err(Error::framing(format!(
                "bulk overflow: {} + {} exceeds announced {}",
                self.buffer.len(),
                chunk.len(),
                self.expected
            )));
        }

        self.buffer.extend_from_slice(chunk);
        if self.buffer.len() < self.expected {
            return Ok(None);
        }

        Ok(Some(BulkImage {
            width: self.width,
            height: self.height,
            data: self.buffer.split().freeze(),
        }))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Bytes received so far.
    pub fn received(&self) -> usize {
        self.buffer.len()
    }

    /// Total bytes announced by the header.
    pub fn expected(&self) -> usize {
        self.expected
    }
}

fn parse_field<T: std::str::FromStr>(raw: &str, name: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| Error::framing(format!("invalid bulk header {name}: {raw:?}")))
}
