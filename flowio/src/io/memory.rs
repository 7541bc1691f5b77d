//! In-memory source and sink over a shared [`Buffer`]

use bytes::Bytes;
use std::io;

use super::buffer::Buffer;
use super::types::{Sink, Source};
use crate::error::StreamError;

/// Source that replays a byte sequence
///
/// Chunks are sliced from the data without copying. `with_chunk_size`
/// caps every chunk below the stream's own pull size.
#[derive(Debug)]
pub struct MemorySource {
    data: Bytes,
    pos: usize,
    chunk_size: Option<usize>,
}

impl MemorySource {
    #[must_use]
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            pos: 0,
            chunk_size: None,
        }
    }

    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size.max(1));
        self
    }
}

impl Source for MemorySource {
    async fn open(&mut self) -> io::Result<()> {
        Ok(())
    }

    async fn read_next(&mut self, max_len: usize) -> io::Result<Option<Bytes>> {
        if self.pos >= self.data.len() {
            return Ok(None);
        }
        let limit = self.chunk_size.map_or(max_len, |size| size.min(max_len));
        let end = (self.pos + limit.max(1)).min(self.data.len());
        let chunk = self.data.slice(self.pos..end);
        self.pos = end;
        Ok(Some(chunk))
    }

    async fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Sink that appends to a shared [`Buffer`]
///
/// `with_max_write` makes every flush accept at most that many bytes,
/// which exercises the partial-write retry of the flush step.
#[derive(Debug, Clone)]
pub struct MemorySink {
    buffer: Buffer,
    max_write: Option<usize>,
}

impl MemorySink {
    #[must_use]
    pub fn new(buffer: Buffer) -> Self {
        Self {
            buffer,
            max_write: None,
        }
    }

    #[must_use]
    pub fn with_max_write(mut self, max_write: usize) -> Self {
        self.max_write = Some(max_write);
        self
    }
}

impl Sink for MemorySink {
    async fn construct(&mut self) -> io::Result<()> {
        Ok(())
    }

    async fn flush(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let n = self.max_write.map_or(bytes.len(), |max| max.min(bytes.len()));
        let accepted = bytes.get(..n).unwrap_or(bytes);
        self.buffer.append(accepted);
        Ok(accepted.len())
    }

    async fn release(&mut self, _error: Option<&StreamError>) -> io::Result<()> {
        Ok(())
    }
}
