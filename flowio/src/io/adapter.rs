//! Sources and sinks over any tokio `AsyncRead` / `AsyncWrite`
//!
//! Covers sockets, pipes, stdin and stdout without a dedicated type each.

use bytes::{Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::types::{Sink, Source};
use crate::error::StreamError;

/// Source reading from an `AsyncRead`
pub struct AsyncReadSource<R> {
    reader: Option<R>,
}

impl<R> AsyncReadSource<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    #[must_use]
    pub fn new(reader: R) -> Self {
        Self {
            reader: Some(reader),
        }
    }
}

impl<R> Source for AsyncReadSource<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    async fn open(&mut self) -> io::Result<()> {
        Ok(())
    }

    async fn read_next(&mut self, max_len: usize) -> io::Result<Option<Bytes>> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        let mut buf = BytesMut::with_capacity(max_len);
        let n = reader.read_buf(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(buf.freeze()))
    }

    async fn close(&mut self) -> io::Result<()> {
        self.reader = None;
        Ok(())
    }
}

/// Sink writing into an `AsyncWrite`
///
/// On a clean release the writer is flushed and shut down; after a failure
/// it is only dropped.
pub struct AsyncWriteSink<W> {
    writer: Option<W>,
}

impl<W> AsyncWriteSink<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    #[must_use]
    pub fn new(writer: W) -> Self {
        Self {
            writer: Some(writer),
        }
    }
}

impl<W> Sink for AsyncWriteSink<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn construct(&mut self) -> io::Result<()> {
        Ok(())
    }

    async fn flush(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "writer released"));
        };
        writer.write(bytes).await
    }

    async fn release(&mut self, error: Option<&StreamError>) -> io::Result<()> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        if error.is_none() {
            writer.flush().await?;
            writer.shutdown().await?;
        }
        Ok(())
    }
}
