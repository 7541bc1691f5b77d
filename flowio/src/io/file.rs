//! File-backed source and sink on top of `tokio::fs`

use bytes::{Bytes, BytesMut};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use super::types::{Sink, Source};
use crate::error::StreamError;

/// Reads a file front to back
#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    file: Option<File>,
}

impl FileSource {
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: None,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Source for FileSource {
    async fn open(&mut self) -> io::Result<()> {
        let file = File::open(&self.path).await?;
        self.file = Some(file);
        Ok(())
    }

    async fn read_next(&mut self, max_len: usize) -> io::Result<Option<Bytes>> {
        let Some(file) = self.file.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "file is not open"));
        };
        let mut buf = BytesMut::with_capacity(max_len);
        let n = file.read_buf(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(buf.freeze()))
    }

    async fn close(&mut self) -> io::Result<()> {
        self.file = None;
        Ok(())
    }
}

/// Writes a file, truncating or appending
///
/// The file is created in `construct` and flushed to the OS in `release`.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    append: bool,
    file: Option<File>,
    writes: usize,
}

impl FileSink {
    /// Create or truncate `path`
    #[must_use]
    pub fn create(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            append: false,
            file: None,
            writes: 0,
        }
    }

    /// Append to `path`, creating it if needed
    #[must_use]
    pub fn append(path: impl AsRef<Path>) -> Self {
        Self {
            append: true,
            ..Self::create(path)
        }
    }

    /// Number of write calls issued to the file so far
    #[must_use]
    pub fn writes(&self) -> usize {
        self.writes
    }
}

impl Sink for FileSink {
    async fn construct(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .append(self.append)
            .truncate(!self.append)
            .open(&self.path)
            .await?;
        self.file = Some(file);
        Ok(())
    }

    async fn flush(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let Some(file) = self.file.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "file is not open"));
        };
        let n = file.write(bytes).await?;
        self.writes += 1;
        Ok(n)
    }

    async fn release(&mut self, error: Option<&StreamError>) -> io::Result<()> {
        debug!(path = %self.path.display(), writes = self.writes, failed = error.is_some(), "releasing file sink");
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        Ok(())
    }
}
