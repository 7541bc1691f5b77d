//! Writable stream
//!
//! Accepts chunks from a producer, buffers them against the watermark and
//! hands coalesced batches to a [`Sink`] running on a worker task.
//!
//! # Flow control
//!
//! - `write()` enqueues and returns `false` once `length() >= high_water_mark`,
//!   where `length()` counts queued bytes plus the batch the sink is
//!   currently writing. `false` means "stop until `drain`".
//! - When the length reaches the watermark and the sink is idle, the whole
//!   queue is sent to the sink as one batch. Later writes queue behind it.
//! - The queue and the counters live in a ledger shared with the worker.
//!   The worker settles each batch as soon as the sink has taken it: the
//!   length drops, the next batch goes out if the queue is still at the
//!   watermark, and `drain` is emitted once the length is below it. A
//!   producer may wait on `drained()` or on a `subscribe()` receiver.
//! - Sink failures are settled by the worker as well. The stream moves to
//!   `Errored`, the queue is discarded, the sink is released and `error` is
//!   emitted whether or not the owner is awaiting anything.
//!
//! # Worker protocol
//!
//! ```text
//! owner ── Flush(batch) ──▶ worker: sink.flush(..) until the batch is written,
//!                                    settles it, writes the next batch if due
//! owner ◀─ Progress ─────── worker  (constructed, flushed, failed)
//! owner ── Release(err?) ─▶ worker: sink.release(err?), exits
//! owner ◀─ Released ─────── worker
//! ```
//!
//! The sink is released once, by whichever side claims the release in the
//! ledger first. If the owner drops the stream without `end()` or
//! `destroy()`, batches already handed over are still written and the sink
//! is released with no error; queued data that was never handed over is
//! lost.

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::config::StreamOptions;
use crate::error::StreamError;
use crate::idgen::{next_stream_handle, Handle};
use crate::io::{BufferQueue, Sink};
use crate::signal::{SignalHub, WritableEvent};
use crate::state::StreamState;

enum Command {
    Flush(Bytes),
    Release(Option<StreamError>),
}

/// Wake-ups for the owner; the outcome itself is in the ledger
enum Progress {
    Constructed,
    Flushed,
    Failed,
    Released(io::Result<()>),
}

struct Ledger {
    state: StreamState,
    queue: BufferQueue,
    /// Bytes of the batch the sink is writing; zero when the sink is idle
    in_flight: usize,
    high_water_mark: usize,
    ended: bool,
    corked: u32,
    needs_drain: bool,
    constructed: bool,
    released: bool,
    bytes_written: u64,
    flush_count: u64,
    error: Option<StreamError>,
}

impl Ledger {
    fn length(&self) -> usize {
        self.queue.length() + self.in_flight
    }

    fn check_alive(&self) -> Result<(), StreamError> {
        match self.state {
            StreamState::Destroyed => Err(StreamError::Usage("stream destroyed")),
            StreamState::Errored => Err(self.error.clone().unwrap_or(StreamError::Destroyed)),
            _ => Ok(()),
        }
    }

    /// Take the whole queue as the next batch if the sink is idle
    fn take_batch(&mut self) -> Option<Bytes> {
        if self.in_flight > 0 || self.queue.is_empty() {
            return None;
        }
        let batch = self.queue.drain_all();
        if batch.is_empty() {
            return None;
        }
        self.in_flight = batch.len();
        Some(batch)
    }

    fn take_batch_at_watermark(&mut self) -> Option<Bytes> {
        if self.corked > 0 || self.state.is_terminal() || self.length() < self.high_water_mark {
            return None;
        }
        self.take_batch()
    }

    /// Clear a pending drain once the length is back below the watermark
    fn take_drain(&mut self) -> bool {
        if !self.needs_drain || self.length() >= self.high_water_mark {
            return false;
        }
        self.needs_drain = false;
        if self.state == StreamState::Draining {
            self.state = StreamState::Active;
        }
        true
    }

    /// Move to `Errored` and discard the queue
    ///
    /// Returns the discarded byte count, or `None` if the stream was
    /// already terminal.
    fn fail(&mut self, error: &StreamError) -> Option<usize> {
        if self.state.is_terminal() {
            return None;
        }
        self.state = StreamState::Errored;
        self.error = Some(error.clone());
        self.needs_drain = false;
        self.in_flight = 0;
        Some(self.queue.clear())
    }

    fn claim_release(&mut self) -> bool {
        !std::mem::replace(&mut self.released, true)
    }
}

struct Shared {
    handle: Handle,
    ledger: Mutex<Ledger>,
    signals: SignalHub<WritableEvent>,
}

impl Shared {
    /// Account a batch the sink has taken; returns the next batch if due
    fn settle_flush(&self, len: usize) -> Option<Bytes> {
        let (next, drain) = {
            let mut ledger = self.ledger.lock();
            ledger.in_flight = 0;
            ledger.bytes_written += len as u64;
            ledger.flush_count += 1;
            let next = ledger.take_batch_at_watermark();
            (next, ledger.take_drain())
        };
        if drain {
            self.emit_drain();
        }
        next
    }

    fn emit_drain(&self) {
        trace!(stream = %self.handle, "drain");
        self.signals.emit(WritableEvent::Drain);
    }
}

/// Write all of `bytes`, retrying partial writes
async fn flush_fully<S: Sink>(sink: &mut S, handle: Handle, bytes: &[u8]) -> io::Result<()> {
    let mut offset = 0;
    while let Some(rest) = bytes.get(offset..).filter(|rest| !rest.is_empty()) {
        let n = sink.flush(rest).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "sink accepted no bytes",
            ));
        }
        if n < rest.len() {
            trace!(stream = %handle, accepted = n, offered = rest.len(), "partial sink write");
        }
        offset += n.min(rest.len());
    }
    Ok(())
}

/// Error the stream from the worker side, releasing the sink if nobody has
async fn fail_in_worker<S: Sink>(sink: &mut S, shared: &Shared, error: StreamError) {
    let (discarded, claimed) = {
        let mut ledger = shared.ledger.lock();
        (ledger.fail(&error), ledger.claim_release())
    };
    let Some(discarded) = discarded else {
        debug!(stream = %shared.handle, %error, "sink failed after the stream was torn down");
        return;
    };
    warn!(stream = %shared.handle, %error, discarded, "writable failed");
    if claimed {
        if let Err(e) = sink.release(Some(&error)).await {
            warn!(stream = %shared.handle, error = %e, "sink release failed");
        }
    }
    shared.signals.emit_terminal(WritableEvent::Error(error));
}

async fn run_sink<S: Sink>(
    mut sink: S,
    shared: Arc<Shared>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    progress: mpsc::UnboundedSender<Progress>,
) {
    let handle = shared.handle;
    match sink.construct().await {
        Ok(()) => {
            trace!(stream = %handle, "sink constructed");
            shared.ledger.lock().constructed = true;
            let _ = progress.send(Progress::Constructed);
        }
        Err(e) => {
            fail_in_worker(&mut sink, &shared, StreamError::acquisition(e)).await;
            let _ = progress.send(Progress::Failed);
        }
    }

    while let Some(command) = commands.recv().await {
        match command {
            Command::Flush(batch) => {
                let mut next = Some(batch);
                while let Some(bytes) = next.take() {
                    let errored = shared.ledger.lock().state == StreamState::Errored;
                    if errored {
                        trace!(stream = %handle, len = bytes.len(), "dropping batch of a failed stream");
                        break;
                    }
                    match flush_fully(&mut sink, handle, &bytes).await {
                        Ok(()) => {
                            next = shared.settle_flush(bytes.len());
                            let _ = progress.send(Progress::Flushed);
                        }
                        Err(e) => {
                            fail_in_worker(&mut sink, &shared, StreamError::sink_write(e)).await;
                            let _ = progress.send(Progress::Failed);
                        }
                    }
                }
            }
            Command::Release(error) => {
                let result = sink.release(error.as_ref()).await;
                let _ = progress.send(Progress::Released(result));
                return;
            }
        }
    }

    let claimed = shared.ledger.lock().claim_release();
    if claimed {
        debug!(stream = %handle, "writable dropped, releasing sink");
        if let Err(e) = sink.release(None).await {
            warn!(stream = %handle, error = %e, "sink release failed after drop");
        }
    }
}

/// Buffered, backpressure-aware byte sink
///
/// Must be created inside a tokio runtime: the sink runs on a spawned task.
///
/// # Example
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), flowio::StreamError> {
/// use flowio::io::{Buffer, MemorySink};
/// use flowio::{StreamOptions, Writable};
///
/// let buffer = Buffer::new();
/// let options = StreamOptions::new().with_high_water_mark(4);
/// let mut writable = Writable::new(MemorySink::new(buffer.clone()), options)?;
///
/// if !writable.write("hello")? {
///     writable.drained().await?;
/// }
/// writable.end().await?;
/// assert_eq!(&*buffer.lock(), b"hello");
/// # Ok(())
/// # }
/// ```
pub struct Writable {
    handle: Handle,
    hint: String,
    options: StreamOptions,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    progress: mpsc::UnboundedReceiver<Progress>,
}

impl Writable {
    /// Bind `sink` and start its worker
    ///
    /// # Errors
    ///
    /// Returns `InvalidOptions` if `options` do not validate.
    pub fn new<S: Sink>(sink: S, options: StreamOptions) -> Result<Self, StreamError> {
        options.validate()?;
        let handle = next_stream_handle();
        let shared = Arc::new(Shared {
            handle,
            ledger: Mutex::new(Ledger {
                state: StreamState::Idle,
                queue: BufferQueue::new(),
                in_flight: 0,
                high_water_mark: options.high_water_mark,
                ended: false,
                corked: 0,
                needs_drain: false,
                constructed: false,
                released: false,
                bytes_written: 0,
                flush_count: 0,
                error: None,
            }),
            signals: SignalHub::new(handle),
        });
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (progress_tx, progress) = mpsc::unbounded_channel();
        tokio::spawn(run_sink(sink, shared.clone(), command_rx, progress_tx));
        debug!(stream = %handle, hwm = options.high_water_mark, "writable created");

        Ok(Self {
            handle,
            hint: String::from("writable"),
            options,
            shared,
            commands,
            progress,
        })
    }

    /// Attach a label used in logs and `Debug` output
    #[must_use]
    pub fn named(mut self, hint: &str) -> Self {
        self.hint = hint.to_string();
        self
    }

    #[must_use]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    #[must_use]
    pub fn state(&self) -> StreamState {
        self.ledger().state
    }

    /// Queued bytes plus the batch currently being written
    #[must_use]
    pub fn length(&self) -> usize {
        self.ledger().length()
    }

    #[must_use]
    pub fn high_water_mark(&self) -> usize {
        self.options.high_water_mark
    }

    #[must_use]
    pub fn object_mode(&self) -> bool {
        self.options.object_mode
    }

    /// `end()` was called; no more writes are accepted
    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.ledger().ended
    }

    /// Everything was flushed and the sink released
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state() == StreamState::Finished
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.state() == StreamState::Destroyed
    }

    /// Cork nesting depth
    #[must_use]
    pub fn corked(&self) -> u32 {
        self.ledger().corked
    }

    /// Bytes confirmed by the sink
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.ledger().bytes_written
    }

    /// Completed batches handed to the sink
    #[must_use]
    pub fn flush_count(&self) -> u64 {
        self.ledger().flush_count
    }

    #[must_use]
    pub fn error(&self) -> Option<StreamError> {
        self.ledger().error.clone()
    }

    /// Receive `drain`, `finish` and `error` signals emitted from now on
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<WritableEvent> {
        self.shared.signals.subscribe(&self.hint)
    }

    /// Queue a chunk
    ///
    /// Returns `true` while the buffered length stays below the watermark.
    /// On `false` the caller should wait for `drain` (through
    /// [`Writable::drained`] or a subscription) before writing again;
    /// writing anyway is allowed and simply buffers more.
    ///
    /// # Errors
    ///
    /// `Usage` after `end()` or `destroy()`; the terminal error if the
    /// stream has failed.
    pub fn write(&mut self, chunk: impl Into<Bytes>) -> Result<bool, StreamError> {
        let chunk = chunk.into();
        let (batch, below) = {
            let mut ledger = self.ledger();
            ledger.check_alive()?;
            if ledger.ended {
                return Err(StreamError::Usage("write after end"));
            }
            if ledger.state == StreamState::Idle {
                ledger.state = StreamState::Active;
            }
            trace!(stream = %self.handle, len = chunk.len(), "write");
            ledger.queue.enqueue(chunk);
            let batch = ledger.take_batch_at_watermark();

            let below = ledger.length() < ledger.high_water_mark;
            if !below {
                ledger.needs_drain = true;
                ledger.state = StreamState::Draining;
            }
            (batch, below)
        };
        self.send_batch(batch);
        Ok(below)
    }

    /// Wait until a pending drain happens
    ///
    /// Returns at once if no write has returned `false` since the last
    /// drain.
    ///
    /// # Errors
    ///
    /// The terminal error if the sink fails meanwhile; `Usage` if the
    /// stream is corked or destroyed.
    pub async fn drained(&mut self) -> Result<(), StreamError> {
        loop {
            let batch = {
                let mut ledger = self.ledger();
                ledger.check_alive()?;
                if !ledger.needs_drain {
                    return Ok(());
                }
                if ledger.corked > 0 {
                    return Err(StreamError::Usage("awaiting drain while corked"));
                }
                let batch = ledger.take_batch();
                if batch.is_none() && ledger.in_flight == 0 {
                    // nothing buffered at all
                    let drain = ledger.take_drain();
                    drop(ledger);
                    if drain {
                        self.shared.emit_drain();
                    }
                    continue;
                }
                batch
            };
            self.send_batch(batch);
            self.next_progress().await?;
        }
    }

    /// Send everything queued to the sink and wait for it, corked or not
    ///
    /// # Errors
    ///
    /// The terminal error if the sink fails; `Usage` if destroyed.
    pub async fn flush(&mut self) -> Result<(), StreamError> {
        loop {
            let batch = {
                let mut ledger = self.ledger();
                ledger.check_alive()?;
                let batch = ledger.take_batch();
                if batch.is_none() && ledger.in_flight == 0 {
                    return Ok(());
                }
                batch
            };
            self.send_batch(batch);
            self.next_progress().await?;
        }
    }

    /// Stop accepting writes, flush everything and release the sink
    ///
    /// # Errors
    ///
    /// `Usage` if already ended or destroyed; the terminal error if the
    /// sink fails to flush or release.
    pub async fn end(&mut self) -> Result<(), StreamError> {
        self.finish_with(None).await
    }

    /// Like [`Writable::end`], queueing one last chunk first
    ///
    /// # Errors
    ///
    /// See [`Writable::end`].
    pub async fn end_with(&mut self, chunk: impl Into<Bytes>) -> Result<(), StreamError> {
        self.finish_with(Some(chunk.into())).await
    }

    async fn finish_with(&mut self, last: Option<Bytes>) -> Result<(), StreamError> {
        {
            let mut ledger = self.ledger();
            ledger.check_alive()?;
            if ledger.ended {
                return Err(StreamError::Usage("end called twice"));
            }
            if let Some(chunk) = last {
                ledger.queue.enqueue(chunk);
            }
            ledger.ended = true;
            ledger.corked = 0;
            ledger.needs_drain = false;
            if matches!(ledger.state, StreamState::Idle | StreamState::Draining) {
                ledger.state = StreamState::Active;
            }
            debug!(stream = %self.handle, buffered = ledger.length(), "ending writable");
        }

        self.flush().await?;
        loop {
            {
                let ledger = self.ledger();
                ledger.check_alive()?;
                if ledger.constructed {
                    break;
                }
            }
            self.next_progress().await?;
        }

        match self.release_sink(None).await {
            Ok(()) => {
                let (bytes, flushes) = {
                    let mut ledger = self.ledger();
                    ledger.state = StreamState::Finished;
                    (ledger.bytes_written, ledger.flush_count)
                };
                debug!(stream = %self.handle, bytes, flushes, "writable finished");
                self.shared.signals.emit_terminal(WritableEvent::Finish);
                Ok(())
            }
            Err(e) => {
                let error = StreamError::release(e);
                warn!(stream = %self.handle, %error, "writable failed on release");
                {
                    let mut ledger = self.ledger();
                    ledger.state = StreamState::Errored;
                    ledger.error = Some(error.clone());
                }
                self.shared
                    .signals
                    .emit_terminal(WritableEvent::Error(error.clone()));
                Err(error)
            }
        }
    }

    /// Hold back flushes until the matching `uncork()`
    pub fn cork(&mut self) {
        let mut ledger = self.ledger();
        if !ledger.ended && !ledger.state.is_terminal() {
            ledger.corked += 1;
        }
    }

    /// Undo one `cork()`; the outermost one flushes what accumulated
    pub fn uncork(&mut self) {
        let batch = {
            let mut ledger = self.ledger();
            if ledger.corked == 0 {
                return;
            }
            ledger.corked -= 1;
            if ledger.corked == 0 && !ledger.state.is_terminal() {
                ledger.take_batch()
            } else {
                None
            }
        };
        self.send_batch(batch);
    }

    /// Tear the stream down
    ///
    /// Stops handing batches to the sink, waits for the batch in flight,
    /// discards the queue and releases the sink with `error`. A given error
    /// is also emitted as the `error` signal. The stream ends `Destroyed`.
    ///
    /// # Errors
    ///
    /// `Usage` on a second call; `Release` if the sink fails to release.
    pub async fn destroy(&mut self, error: Option<StreamError>) -> Result<(), StreamError> {
        let prior = {
            let mut ledger = self.ledger();
            if ledger.state == StreamState::Destroyed {
                return Err(StreamError::Usage("destroy called twice"));
            }
            let discarded = ledger.queue.clear();
            ledger.needs_drain = false;
            debug!(stream = %self.handle, prior = %ledger.state, discarded, "destroying writable");
            ledger.state
        };

        let released = self.release_sink(error.clone()).await;
        let emit = {
            let mut ledger = self.ledger();
            ledger.state = StreamState::Destroyed;
            match error {
                Some(err) if !prior.is_terminal() => {
                    ledger.error.get_or_insert_with(|| err.clone());
                    Some(err)
                }
                _ => None,
            }
        };
        match emit {
            Some(err) => self.shared.signals.emit_terminal(WritableEvent::Error(err)),
            None => self.shared.signals.close(),
        }
        released.map_err(StreamError::release)
    }

    /// Fail the stream from outside
    ///
    /// Discards the queue, lets the batch in flight complete, releases the
    /// sink with `error`, moves to `Errored` and emits `error`. Does
    /// nothing on a stream that already finished, failed or was destroyed.
    ///
    /// # Errors
    ///
    /// `Release` if the sink fails to release.
    pub async fn abort(&mut self, error: StreamError) -> Result<(), StreamError> {
        let discarded = self.ledger().fail(&error);
        let Some(discarded) = discarded else {
            return Ok(());
        };
        warn!(stream = %self.handle, %error, discarded, "writable aborted");
        let released = self.release_sink(Some(error.clone())).await;
        self.shared
            .signals
            .emit_terminal(WritableEvent::Error(error));
        released.map_err(StreamError::release)
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.shared.ledger.lock()
    }

    fn send_batch(&self, batch: Option<Bytes>) {
        let Some(batch) = batch else {
            return;
        };
        trace!(stream = %self.handle, len = batch.len(), "dispatching flush");
        if self.commands.send(Command::Flush(batch)).is_err() {
            warn!(stream = %self.handle, "sink worker is gone");
        }
    }

    /// Wait until the worker reports something
    async fn next_progress(&mut self) -> Result<(), StreamError> {
        if self.progress.recv().await.is_some() {
            return Ok(());
        }
        let error = StreamError::Destroyed;
        let failed = self.ledger().fail(&error);
        if failed.is_some() {
            warn!(stream = %self.handle, "sink worker exited unexpectedly");
            self.shared
                .signals
                .emit_terminal(WritableEvent::Error(error.clone()));
        }
        Err(error)
    }

    /// Ask the worker to release the sink and wait for the answer
    ///
    /// A batch still in flight completes first. Does nothing if the worker
    /// already released the sink after a failure.
    async fn release_sink(&mut self, error: Option<StreamError>) -> io::Result<()> {
        let claimed = self.ledger().claim_release();
        if !claimed || self.commands.send(Command::Release(error)).is_err() {
            return Ok(());
        }
        while let Some(progress) = self.progress.recv().await {
            if let Progress::Released(result) = progress {
                return result;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Writable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ledger = self.ledger();
        write!(
            f,
            "Writable(handle={}, state={}, length={}, hwm={}, ended={}, corked={}, hint={})",
            self.handle,
            ledger.state,
            ledger.length(),
            self.options.high_water_mark,
            ledger.ended,
            ledger.corked,
            self.hint
        )
    }
}
