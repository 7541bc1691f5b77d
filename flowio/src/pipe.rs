//! Pipe coordinator
//!
//! Relays chunks from a [`Readable`] into a [`Writable`] under both
//! streams' flow control:
//!
//! - every chunk read is written;
//! - a write returning `false` pauses the readable until the writable
//!   drains, then resumes it;
//! - the readable ending ends the writable;
//! - a failure on either side aborts the other with the same error, so
//!   both end `Errored`.
//!
//! Buffered memory stays within the two watermarks plus one chunk per side,
//! whatever the total size of the transfer.

use tracing::{debug, trace, warn};

use crate::error::{PipeError, PipeSide, StreamError};
use crate::readable::Readable;
use crate::writable::Writable;

/// Counters of one completed transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipeStats {
    /// Bytes moved from the readable to the writable
    pub bytes: u64,
    /// Chunks moved
    pub chunks: u64,
    /// Times the readable was paused for backpressure
    pub pauses: u64,
    /// Largest combined buffered length of both streams
    pub peak_buffered: usize,
}

/// One transfer between a readable and a writable
pub struct Pipe<'a> {
    readable: &'a mut Readable,
    writable: &'a mut Writable,
    stats: PipeStats,
}

impl<'a> Pipe<'a> {
    pub fn new(readable: &'a mut Readable, writable: &'a mut Writable) -> Self {
        Self {
            readable,
            writable,
            stats: PipeStats::default(),
        }
    }

    /// Move everything, then end the writable
    ///
    /// # Errors
    ///
    /// A [`PipeError`] naming the side that failed first. The other side has
    /// been aborted with the same cause by the time this returns.
    pub async fn run(mut self) -> Result<PipeStats, PipeError> {
        debug!(
            readable = %self.readable.handle(),
            writable = %self.writable.handle(),
            "pipe started"
        );

        loop {
            let chunk = match self.readable.read().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(cause) => return Err(self.abort(PipeSide::Readable, cause).await),
            };
            self.stats.bytes += chunk.len() as u64;
            self.stats.chunks += 1;

            match self.writable.write(chunk) {
                Ok(true) => self.observe_buffered(),
                Ok(false) => {
                    self.observe_buffered();
                    self.stats.pauses += 1;
                    trace!(writable = %self.writable.handle(), "backpressure, pausing readable");
                    self.readable.pause();
                    if let Err(cause) = self.writable.drained().await {
                        return Err(self.abort(PipeSide::Writable, cause).await);
                    }
                    self.readable.resume();
                }
                Err(cause) => return Err(self.abort(PipeSide::Writable, cause).await),
            }
        }

        if let Err(cause) = self.writable.end().await {
            return Err(self.abort(PipeSide::Writable, cause).await);
        }
        debug!(
            bytes = self.stats.bytes,
            chunks = self.stats.chunks,
            pauses = self.stats.pauses,
            "pipe finished"
        );
        Ok(self.stats)
    }

    fn observe_buffered(&mut self) {
        let buffered = self.readable.length() + self.writable.length();
        self.stats.peak_buffered = self.stats.peak_buffered.max(buffered);
    }

    /// Abort the side that did not fail and build the composite error
    async fn abort(&mut self, side: PipeSide, cause: StreamError) -> PipeError {
        warn!(%side, %cause, "pipe failed");
        let abort = match side {
            PipeSide::Readable => self.writable.abort(cause.clone()).await.err(),
            PipeSide::Writable => self.readable.abort(cause.clone()).await.err(),
        };
        if let Some(err) = &abort {
            warn!(%err, "tearing down the other side failed");
        }
        PipeError { side, cause, abort }
    }
}

/// Pipe `readable` into `writable` until the readable ends
///
/// # Errors
///
/// See [`Pipe::run`].
///
/// # Example
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// use flowio::io::{Buffer, MemorySink, MemorySource};
/// use flowio::{pipe, Readable, StreamOptions, Writable};
///
/// let out = Buffer::new();
/// let options = StreamOptions::new().with_high_water_mark(8);
/// let mut readable = Readable::new(MemorySource::new("a longer message than 8 bytes"), options)?;
/// let mut writable = Writable::new(MemorySink::new(out.clone()), options)?;
///
/// let stats = pipe(&mut readable, &mut writable).await?;
/// assert_eq!(stats.bytes, 29);
/// assert_eq!(&*out.lock(), b"a longer message than 8 bytes");
/// # Ok(())
/// # }
/// ```
pub async fn pipe(readable: &mut Readable, writable: &mut Writable) -> Result<PipeStats, PipeError> {
    Pipe::new(readable, writable).run().await
}
