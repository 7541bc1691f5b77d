//! Sink that digests everything written to it

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::io;
use std::sync::Arc;

use super::types::Sink;
use crate::error::StreamError;

/// SHA-256 of the bytes written, available once the sink is released
#[derive(Debug, Clone, Default)]
pub struct DigestHandle(Arc<Mutex<Option<[u8; 32]>>>);

impl DigestHandle {
    /// Raw digest, or `None` if the stream has not finished successfully
    #[must_use]
    pub fn get(&self) -> Option<[u8; 32]> {
        *self.0.lock()
    }

    /// Lower-case hex digest
    #[must_use]
    pub fn hex(&self) -> Option<String> {
        self.get().map(hex::encode)
    }
}

/// Hash accumulator sink
///
/// Keep a [`DigestHandle`] before moving the sink into a `Writable`; the
/// digest is published on a clean release and left empty on failure.
#[derive(Debug)]
pub struct HashSink {
    hasher: Sha256,
    digest: DigestHandle,
    bytes: u64,
}

impl HashSink {
    #[must_use]
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
            digest: DigestHandle::default(),
            bytes: 0,
        }
    }

    #[must_use]
    pub fn digest_handle(&self) -> DigestHandle {
        self.digest.clone()
    }
}

impl Default for HashSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Sink for HashSink {
    async fn construct(&mut self) -> io::Result<()> {
        Ok(())
    }

    async fn flush(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.hasher.update(bytes);
        self.bytes += bytes.len() as u64;
        Ok(bytes.len())
    }

    async fn release(&mut self, error: Option<&StreamError>) -> io::Result<()> {
        if error.is_none() {
            let hasher = std::mem::take(&mut self.hasher);
            *self.digest.0.lock() = Some(hasher.finalize().into());
        }
        Ok(())
    }
}
