use bytes::Bytes;
use flowio::io::{MemorySource, Source};
use flowio::{Readable, ReadableEvent, StreamError, StreamOptions, StreamState};
use futures::StreamExt;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct Counters {
    pulls: AtomicUsize,
    closes: AtomicUsize,
}

// Source double producing `count` chunks of `size` bytes, optionally
// failing open or a given pull (1-based)
struct CountingSource {
    counters: Arc<Counters>,
    size: usize,
    remaining: usize,
    fail_open: bool,
    fail_on_pull: Option<usize>,
}

impl CountingSource {
    fn new(size: usize, count: usize) -> (Self, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let source = Self {
            counters: counters.clone(),
            size,
            remaining: count,
            fail_open: false,
            fail_on_pull: None,
        };
        (source, counters)
    }
}

impl Source for CountingSource {
    async fn open(&mut self) -> io::Result<()> {
        if self.fail_open {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such source"));
        }
        Ok(())
    }

    async fn read_next(&mut self, max_len: usize) -> io::Result<Option<Bytes>> {
        let pulls = self.counters.pulls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_pull == Some(pulls) {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "peer went away"));
        }
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        Ok(Some(Bytes::from(vec![b'x'; self.size.min(max_len)])))
    }

    async fn close(&mut self) -> io::Result<()> {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn options(hwm: usize) -> StreamOptions {
    StreamOptions::new().with_high_water_mark(hwm)
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_reads_everything_then_ends() {
    let source = MemorySource::new("hello world").with_chunk_size(3);
    let mut readable = Readable::new(source, options(16)).unwrap();
    let mut events = readable.subscribe();

    let mut collected = Vec::new();
    while let Some(chunk) = readable.read().await.unwrap() {
        collected.extend_from_slice(&chunk);
    }
    assert_eq!(collected, b"hello world");
    assert!(readable.is_ended());
    assert_eq!(readable.bytes_read(), 11);

    // Reading past the end keeps returning None
    assert!(readable.read().await.unwrap().is_none());

    let mut data = 0;
    let mut ends = 0;
    while let Some(event) = events.recv().await {
        match event {
            ReadableEvent::Data(_) => data += 1,
            ReadableEvent::End => ends += 1,
            ReadableEvent::Error(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(data, 4);
    assert_eq!(ends, 1);
}

#[tokio::test]
async fn test_empty_source() {
    let (source, counters) = CountingSource::new(1, 0);
    let mut readable = Readable::new(source, options(4)).unwrap();
    let mut events = readable.subscribe();

    assert!(readable.read().await.unwrap().is_none());
    assert_eq!(readable.state(), StreamState::Finished);
    assert!(matches!(events.recv().await, Some(ReadableEvent::End)));
    assert!(events.recv().await.is_none());
    assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_buffer_stays_bounded() {
    let (source, _counters) = CountingSource::new(3, 200);
    let mut readable = Readable::new(source, options(8)).unwrap();

    let mut total = 0;
    while let Some(chunk) = readable.read().await.unwrap() {
        total += chunk.len();
        settle().await;
        let buffered = readable.length();
        assert!(buffered <= 8 + 3, "buffered {buffered}");
        if total + 8 <= 600 {
            // refilled in the background, not just one chunk ahead
            assert!(buffered >= 8 - 3, "buffered {buffered} after {total}");
        }
    }
    assert_eq!(total, 600);
    assert!(readable.peak_length() <= 8 + 3);
}

#[tokio::test]
async fn test_refills_to_watermark_while_flowing() {
    let (source, counters) = CountingSource::new(2, 1000);
    let mut readable = Readable::new(source, options(100)).unwrap();

    readable.resume();
    settle().await;
    assert_eq!(readable.length(), 100);
    assert_eq!(counters.pulls.load(Ordering::SeqCst), 50);

    for _ in 0..20 {
        readable.read().await.unwrap().unwrap();
        settle().await;
        assert!(readable.length() >= 100 - 2);
    }
    assert_eq!(readable.peak_length(), 100);
    assert_eq!(readable.bytes_read(), 40);
}

#[tokio::test]
async fn test_pause_resume_idempotent() {
    let source = MemorySource::new("abcdef");
    let mut readable = Readable::new(source, options(4)).unwrap();
    let mut events = readable.subscribe();

    readable.pause();
    readable.pause();
    assert!(readable.is_paused());
    readable.resume();
    readable.resume();
    readable.pause();
    readable.resume();
    assert!(!readable.is_paused());
    assert_eq!(readable.state(), StreamState::Active);

    // Prefetching fills the buffer but hands nothing to the consumer
    settle().await;
    assert_eq!(readable.length(), 4);
    assert!(events.try_recv().is_err());

    assert_eq!(readable.read().await.unwrap().unwrap(), &b"abcd"[..]);
    assert_eq!(readable.read().await.unwrap().unwrap(), &b"ef"[..]);
    assert!(readable.read().await.unwrap().is_none());
}

#[tokio::test]
async fn test_pause_stops_prefetch() {
    let (source, counters) = CountingSource::new(2, 10);
    let mut readable = Readable::new(source, options(100)).unwrap();

    readable.pause();
    let chunk = readable.read().await.unwrap().unwrap();
    assert_eq!(chunk.len(), 2);
    assert_eq!(readable.state(), StreamState::Paused);
    settle().await;
    assert_eq!(counters.pulls.load(Ordering::SeqCst), 1);
    assert_eq!(readable.length(), 0);

    // The rest of the source, then its end
    readable.resume();
    settle().await;
    assert_eq!(counters.pulls.load(Ordering::SeqCst), 11);
    assert_eq!(readable.length(), 18);
}

#[tokio::test]
async fn test_source_failure() {
    let (mut source, counters) = CountingSource::new(2, 10);
    source.fail_on_pull = Some(2);
    let mut readable = Readable::new(source, options(100)).unwrap();
    let mut events = readable.subscribe();

    // Paused, so each read pulls exactly once
    readable.pause();
    readable.read().await.unwrap().unwrap();
    let err = readable.read().await.unwrap_err();
    assert!(matches!(err, StreamError::SourceRead(_)));
    assert_eq!(err.io_kind(), Some(io::ErrorKind::ConnectionReset));
    assert_eq!(readable.state(), StreamState::Errored);

    assert!(matches!(events.recv().await, Some(ReadableEvent::Data(_))));
    assert!(matches!(
        events.recv().await,
        Some(ReadableEvent::Error(StreamError::SourceRead(_)))
    ));
    assert!(events.recv().await.is_none());

    assert!(matches!(
        readable.read().await,
        Err(StreamError::SourceRead(_))
    ));
    assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_open_failure_still_closes() {
    let (mut source, counters) = CountingSource::new(2, 10);
    source.fail_open = true;
    let mut readable = Readable::new(source, options(4)).unwrap();

    let err = readable.read().await.unwrap_err();
    assert!(matches!(err, StreamError::ResourceAcquisition(_)));
    assert_eq!(counters.pulls.load(Ordering::SeqCst), 0);
    assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_destroy() {
    let (source, counters) = CountingSource::new(2, 10);
    let mut readable = Readable::new(source, options(4)).unwrap();
    let mut events = readable.subscribe();

    readable.read().await.unwrap().unwrap();
    readable.destroy(None).await.unwrap();
    assert_eq!(readable.state(), StreamState::Destroyed);
    assert_eq!(readable.length(), 0);

    assert!(readable.read().await.unwrap_err().is_usage());
    assert!(readable.destroy(None).await.unwrap_err().is_usage());
    assert_eq!(counters.closes.load(Ordering::SeqCst), 1);

    assert!(matches!(events.recv().await, Some(ReadableEvent::Data(_))));
    assert!(events.recv().await.is_none());
}

#[tokio::test]
async fn test_into_stream() {
    let source = MemorySource::new("streamed bytes").with_chunk_size(5);
    let readable = Readable::new(source, options(8)).unwrap();

    let chunks: Vec<_> = readable.into_stream().collect().await;
    let joined: Vec<u8> = chunks
        .into_iter()
        .map(|chunk| chunk.unwrap())
        .flat_map(|chunk| chunk.to_vec())
        .collect();
    assert_eq!(joined, b"streamed bytes");
}

#[tokio::test]
async fn test_abort_moves_to_errored() {
    let (source, counters) = CountingSource::new(2, 10);
    let mut readable = Readable::new(source, options(8)).unwrap();
    let mut events = readable.subscribe();

    readable.read().await.unwrap().unwrap();
    readable
        .abort(StreamError::Usage("downstream failed"))
        .await
        .unwrap();

    assert_eq!(readable.state(), StreamState::Errored);
    assert_eq!(readable.length(), 0);
    assert!(matches!(readable.read().await, Err(StreamError::Usage(_))));
    assert_eq!(counters.closes.load(Ordering::SeqCst), 1);

    assert!(matches!(events.recv().await, Some(ReadableEvent::Data(_))));
    assert!(matches!(
        events.recv().await,
        Some(ReadableEvent::Error(StreamError::Usage(_)))
    ));
    assert!(events.recv().await.is_none());

    // Destroying afterwards still works and closes nothing twice
    readable.destroy(None).await.unwrap();
    assert_eq!(readable.state(), StreamState::Destroyed);
    assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
}
