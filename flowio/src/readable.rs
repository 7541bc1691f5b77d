//! Readable stream
//!
//! Pulls chunks from a [`Source`] running on a worker task, buffers them
//! below the watermark and hands them to the consumer through `read()`.
//!
//! The buffer lives in a ledger shared with the worker. Once the stream has
//! started (first `read()` or `resume()`), the worker keeps pulling while
//! the stream is flowing and `length() < high_water_mark`, so the buffer
//! refills up to the watermark in the background. A pull is only issued
//! below the watermark, which bounds the buffer to the watermark plus one
//! chunk. While paused the worker pulls only for a `read()` that found the
//! buffer empty.
//!
//! A source failure is settled by the worker: the stream moves to
//! `Errored`, buffered chunks are discarded, the source is closed and
//! `error` is emitted.

use bytes::Bytes;
use futures::Stream;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, trace, warn};

use crate::config::StreamOptions;
use crate::error::StreamError;
use crate::idgen::{next_stream_handle, Handle};
use crate::io::{BufferQueue, Source};
use crate::signal::{ReadableEvent, SignalHub};
use crate::state::StreamState;

enum Request {
    /// Re-check whether a pull is due
    Wake,
    Close,
}

enum Progress {
    Pulled,
    Failed,
    Closed(io::Result<()>),
}

struct Ledger {
    state: StreamState,
    queue: BufferQueue,
    high_water_mark: usize,
    started: bool,
    paused: bool,
    /// A `read()` is waiting on an empty buffer
    demand: bool,
    source_done: bool,
    closed: bool,
    bytes_read: u64,
    peak_length: usize,
    error: Option<StreamError>,
}

impl Ledger {
    fn wants_pull(&self) -> bool {
        self.started
            && !self.source_done
            && !self.closed
            && !self.state.is_terminal()
            && (self.demand || (!self.paused && self.queue.length() < self.high_water_mark))
    }

    /// Move to `Errored` and discard the buffer
    ///
    /// Returns the discarded byte count, or `None` if the stream was
    /// already terminal.
    fn fail(&mut self, error: &StreamError) -> Option<usize> {
        if self.state.is_terminal() {
            return None;
        }
        self.state = StreamState::Errored;
        self.error = Some(error.clone());
        self.demand = false;
        Some(self.queue.clear())
    }

    fn claim_close(&mut self) -> bool {
        !std::mem::replace(&mut self.closed, true)
    }
}

struct Shared {
    handle: Handle,
    ledger: Mutex<Ledger>,
    signals: SignalHub<ReadableEvent>,
}

async fn fail_in_worker<S: Source>(source: &mut S, shared: &Shared, error: StreamError) {
    let (discarded, claimed) = {
        let mut ledger = shared.ledger.lock();
        (ledger.fail(&error), ledger.claim_close())
    };
    let Some(discarded) = discarded else {
        debug!(stream = %shared.handle, %error, "source failed after the stream was torn down");
        return;
    };
    warn!(stream = %shared.handle, %error, discarded, "readable failed");
    if claimed {
        if let Err(e) = source.close().await {
            warn!(stream = %shared.handle, error = %e, "source close failed");
        }
    }
    shared.signals.emit_terminal(ReadableEvent::Error(error));
}

async fn pull_once<S: Source>(
    source: &mut S,
    shared: &Shared,
    progress: &mpsc::UnboundedSender<Progress>,
) {
    let max_len = shared.ledger.lock().high_water_mark;
    trace!(stream = %shared.handle, max_len, "pull");
    match source.read_next(max_len).await {
        Ok(Some(chunk)) => {
            {
                let mut ledger = shared.ledger.lock();
                if !chunk.is_empty() && !ledger.closed && !ledger.state.is_terminal() {
                    ledger.queue.enqueue(chunk);
                    ledger.demand = false;
                    ledger.peak_length = ledger.peak_length.max(ledger.queue.length());
                }
            }
            let _ = progress.send(Progress::Pulled);
        }
        Ok(None) => {
            {
                let mut ledger = shared.ledger.lock();
                ledger.source_done = true;
                ledger.demand = false;
                debug!(stream = %shared.handle, buffered = ledger.queue.length(), "source exhausted");
            }
            let _ = progress.send(Progress::Pulled);
        }
        Err(e) => {
            fail_in_worker(source, shared, StreamError::source_read(e)).await;
            let _ = progress.send(Progress::Failed);
        }
    }
}

async fn run_source<S: Source>(
    mut source: S,
    shared: Arc<Shared>,
    mut requests: mpsc::UnboundedReceiver<Request>,
    progress: mpsc::UnboundedSender<Progress>,
) {
    let handle = shared.handle;
    match source.open().await {
        Ok(()) => trace!(stream = %handle, "source opened"),
        Err(e) => {
            fail_in_worker(&mut source, &shared, StreamError::acquisition(e)).await;
            let _ = progress.send(Progress::Failed);
        }
    }

    loop {
        let wants_pull = shared.ledger.lock().wants_pull();
        // A pending close is seen before the next pull
        let request = if wants_pull {
            match requests.try_recv() {
                Ok(request) => Some(request),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => break,
            }
        } else {
            match requests.recv().await {
                Some(request) => Some(request),
                None => break,
            }
        };

        match request {
            Some(Request::Close) => {
                let result = source.close().await;
                let _ = progress.send(Progress::Closed(result));
                return;
            }
            Some(Request::Wake) => {}
            None => pull_once(&mut source, &shared, &progress).await,
        }
    }

    let claimed = shared.ledger.lock().claim_close();
    if claimed {
        debug!(stream = %handle, "readable dropped, closing source");
        if let Err(e) = source.close().await {
            warn!(stream = %handle, error = %e, "source close failed after drop");
        }
    }
}

/// Buffered, self-throttling byte source
///
/// Must be created inside a tokio runtime: the source runs on a spawned task.
///
/// # Example
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), flowio::StreamError> {
/// use flowio::io::MemorySource;
/// use flowio::{Readable, StreamOptions};
///
/// let source = MemorySource::new("hello world");
/// let mut readable = Readable::new(source, StreamOptions::new().with_high_water_mark(4))?;
///
/// let mut collected = Vec::new();
/// while let Some(chunk) = readable.read().await? {
///     collected.extend_from_slice(&chunk);
/// }
/// assert_eq!(collected, b"hello world");
/// # Ok(())
/// # }
/// ```
pub struct Readable {
    handle: Handle,
    hint: String,
    options: StreamOptions,
    shared: Arc<Shared>,
    requests: mpsc::UnboundedSender<Request>,
    progress: mpsc::UnboundedReceiver<Progress>,
}

impl Readable {
    /// Bind `source` and start its worker
    ///
    /// The source is opened right away, but nothing is pulled until the
    /// first `read()` or `resume()`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOptions` if `options` do not validate.
    pub fn new<S: Source>(source: S, options: StreamOptions) -> Result<Self, StreamError> {
        options.validate()?;
        let handle = next_stream_handle();
        let shared = Arc::new(Shared {
            handle,
            ledger: Mutex::new(Ledger {
                state: StreamState::Idle,
                queue: BufferQueue::new(),
                high_water_mark: options.high_water_mark,
                started: false,
                paused: false,
                demand: false,
                source_done: false,
                closed: false,
                bytes_read: 0,
                peak_length: 0,
                error: None,
            }),
            signals: SignalHub::new(handle),
        });
        let (requests, request_rx) = mpsc::unbounded_channel();
        let (progress_tx, progress) = mpsc::unbounded_channel();
        tokio::spawn(run_source(source, shared.clone(), request_rx, progress_tx));
        debug!(stream = %handle, hwm = options.high_water_mark, "readable created");

        Ok(Self {
            handle,
            hint: String::from("readable"),
            options,
            shared,
            requests,
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

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.ledger().paused
    }

    /// Bytes buffered and not yet read
    #[must_use]
    pub fn length(&self) -> usize {
        self.ledger().queue.length()
    }

    /// Largest buffered length observed so far
    #[must_use]
    pub fn peak_length(&self) -> usize {
        self.ledger().peak_length
    }

    #[must_use]
    pub fn high_water_mark(&self) -> usize {
        self.options.high_water_mark
    }

    #[must_use]
    pub fn object_mode(&self) -> bool {
        self.options.object_mode
    }

    /// Bytes handed to the consumer
    #[must_use]
    pub fn bytes_read(&self) -> u64 {
        self.ledger().bytes_read
    }

    /// The source is exhausted and every chunk was read
    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.state() == StreamState::Finished
    }

    #[must_use]
    pub fn error(&self) -> Option<StreamError> {
        self.ledger().error.clone()
    }

    /// Receive `data`, `end` and `error` signals emitted from now on
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ReadableEvent> {
        self.shared.signals.subscribe(&self.hint)
    }

    /// Next chunk, or `None` once the source is exhausted
    ///
    /// Waits for the source when nothing is buffered. Works while paused:
    /// an explicit read always gets the pull it needs.
    ///
    /// # Errors
    ///
    /// `Usage` after `destroy()`; the terminal error if the source failed.
    pub async fn read(&mut self) -> Result<Option<Bytes>, StreamError> {
        loop {
            let (chunk, exhausted, wake) = {
                let mut ledger = self.ledger();
                let state = ledger.state;
                match state {
                    StreamState::Destroyed => return Err(StreamError::Usage("read after destroy")),
                    StreamState::Errored => {
                        return Err(ledger.error.clone().unwrap_or(StreamError::Destroyed))
                    }
                    StreamState::Finished => return Ok(None),
                    StreamState::Idle => {
                        ledger.state = if ledger.paused {
                            StreamState::Paused
                        } else {
                            StreamState::Active
                        };
                    }
                    _ => {}
                }
                ledger.started = true;

                let chunk = ledger.queue.dequeue();
                match &chunk {
                    Some(chunk) => {
                        ledger.bytes_read += chunk.len() as u64;
                        trace!(stream = %self.handle, len = chunk.len(), buffered = ledger.queue.length(), "read");
                    }
                    None if !ledger.source_done => ledger.demand = true,
                    None => {}
                }
                (chunk, ledger.source_done, ledger.wants_pull())
            };

            if wake {
                self.wake();
            }
            if let Some(chunk) = chunk {
                self.shared.signals.emit(ReadableEvent::Data(chunk.clone()));
                return Ok(Some(chunk));
            }
            if exhausted {
                self.finish().await?;
                return Ok(None);
            }
            self.next_progress().await?;
        }
    }

    /// Stop the eager pull loop; a pull already issued still lands
    pub fn pause(&mut self) {
        let mut ledger = self.ledger();
        if ledger.paused || ledger.state.is_terminal() {
            return;
        }
        trace!(stream = %self.handle, "pause");
        ledger.paused = true;
        if ledger.state == StreamState::Active {
            ledger.state = StreamState::Paused;
        }
    }

    /// Start or restart the eager pull loop
    pub fn resume(&mut self) {
        let wake = {
            let mut ledger = self.ledger();
            if ledger.state.is_terminal() {
                return;
            }
            if ledger.paused {
                trace!(stream = %self.handle, "resume");
                ledger.paused = false;
            }
            if matches!(ledger.state, StreamState::Idle | StreamState::Paused) {
                ledger.state = StreamState::Active;
            }
            ledger.started = true;
            ledger.wants_pull()
        };
        if wake {
            self.wake();
        }
    }

    /// Tear the stream down
    ///
    /// Waits for the pull in flight, discards buffered chunks and closes
    /// the source. A given error is also emitted as the `error` signal.
    /// The stream ends `Destroyed`.
    ///
    /// # Errors
    ///
    /// `Usage` on a second call; `Release` if the source fails to close.
    pub async fn destroy(&mut self, error: Option<StreamError>) -> Result<(), StreamError> {
        let prior = {
            let mut ledger = self.ledger();
            if ledger.state == StreamState::Destroyed {
                return Err(StreamError::Usage("destroy called twice"));
            }
            let discarded = ledger.queue.clear();
            debug!(stream = %self.handle, prior = %ledger.state, discarded, "destroying readable");
            ledger.state
        };

        let closed = self.close_source().await;
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
            Some(err) => self.shared.signals.emit_terminal(ReadableEvent::Error(err)),
            None => self.shared.signals.close(),
        }
        closed.map_err(StreamError::release)
    }

    /// Fail the stream from outside
    ///
    /// Discards buffered chunks, lets the pull in flight land, closes the
    /// source, moves to `Errored` and emits `error`. Does nothing on a
    /// stream that already ended, failed or was destroyed.
    ///
    /// # Errors
    ///
    /// `Release` if the source fails to close.
    pub async fn abort(&mut self, error: StreamError) -> Result<(), StreamError> {
        let discarded = self.ledger().fail(&error);
        let Some(discarded) = discarded else {
            return Ok(());
        };
        warn!(stream = %self.handle, %error, discarded, "readable aborted");
        let closed = self.close_source().await;
        self.shared
            .signals
            .emit_terminal(ReadableEvent::Error(error));
        closed.map_err(StreamError::release)
    }

    /// Adapt into a `Stream` of chunks
    ///
    /// The stream ends after the source is exhausted or after the first
    /// error, which is yielded as the last item.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, StreamError>> {
        futures::stream::unfold(Some(self), |state| async move {
            let mut readable = state?;
            match readable.read().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(readable))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.shared.ledger.lock()
    }

    fn wake(&self) {
        if self.requests.send(Request::Wake).is_err() {
            warn!(stream = %self.handle, "source worker is gone");
        }
    }

    async fn next_progress(&mut self) -> Result<(), StreamError> {
        if self.progress.recv().await.is_some() {
            return Ok(());
        }
        let error = StreamError::Destroyed;
        let failed = self.ledger().fail(&error);
        if failed.is_some() {
            warn!(stream = %self.handle, "source worker exited unexpectedly");
            self.shared
                .signals
                .emit_terminal(ReadableEvent::Error(error.clone()));
        }
        Err(error)
    }

    /// Close the source after the last chunk was read and emit `end`
    async fn finish(&mut self) -> Result<(), StreamError> {
        match self.close_source().await {
            Ok(()) => {
                let bytes = {
                    let mut ledger = self.ledger();
                    ledger.state = StreamState::Finished;
                    ledger.bytes_read
                };
                debug!(stream = %self.handle, bytes, "readable ended");
                self.shared.signals.emit_terminal(ReadableEvent::End);
                Ok(())
            }
            Err(e) => {
                let error = StreamError::release(e);
                warn!(stream = %self.handle, %error, "readable failed on close");
                {
                    let mut ledger = self.ledger();
                    ledger.state = StreamState::Errored;
                    ledger.error = Some(error.clone());
                }
                self.shared
                    .signals
                    .emit_terminal(ReadableEvent::Error(error.clone()));
                Err(error)
            }
        }
    }

    /// Ask the worker to close the source, after any pull in flight
    async fn close_source(&mut self) -> io::Result<()> {
        let claimed = self.ledger().claim_close();
        if !claimed || self.requests.send(Request::Close).is_err() {
            return Ok(());
        }
        while let Some(progress) = self.progress.recv().await {
            if let Progress::Closed(result) = progress {
                return result;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Readable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ledger = self.ledger();
        write!(
            f,
            "Readable(handle={}, state={}, length={}, hwm={}, paused={}, hint={})",
            self.handle,
            ledger.state,
            ledger.queue.length(),
            self.options.high_water_mark,
            ledger.paused,
            self.hint
        )
    }
}
