use bytes::Bytes;
use flowio::io::{Buffer, HashSink, MemorySink, MemorySource, Sink, Source};
use flowio::{pipe, PipeSide, Readable, StreamError, StreamOptions, StreamState, Writable};
use std::io;
use std::sync::{Arc, Mutex};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn options(hwm: usize) -> StreamOptions {
    StreamOptions::new().with_high_water_mark(hwm)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn roundtrip(data: Vec<u8>, hwm: usize) -> Vec<u8> {
    let out = Buffer::new();
    let mut readable = Readable::new(MemorySource::new(data), options(hwm)).unwrap();
    let mut writable = Writable::new(MemorySink::new(out.clone()), options(hwm)).unwrap();

    pipe(&mut readable, &mut writable).await.unwrap();
    assert!(readable.is_ended());
    assert!(writable.is_finished());
    out.to_bytes().to_vec()
}

#[tokio::test]
async fn test_roundtrip_sizes() {
    let hwm = 4;
    for len in [0, 1, 3 * hwm] {
        let data = pattern(len);
        assert_eq!(roundtrip(data.clone(), hwm).await, data, "length {len}");
    }
}

#[tokio::test]
async fn test_large_transfer_is_bounded() {
    init_logging();
    let data = pattern(1024 * 1024);
    let out = Buffer::new();
    let source = MemorySource::new(data.clone()).with_chunk_size(700);
    let mut readable = Readable::new(source, options(1024)).unwrap();
    let mut writable = Writable::new(MemorySink::new(out.clone()), options(2048)).unwrap();

    let stats = pipe(&mut readable, &mut writable).await.unwrap();

    assert_eq!(stats.bytes, data.len() as u64);
    assert!(stats.pauses > 0);
    assert!(stats.peak_buffered <= (1024 + 700) + (2048 + 700));
    assert_eq!(&*out.lock(), data.as_slice());
}

#[tokio::test]
async fn test_partial_writes_through_pipe() {
    let data = pattern(100);
    let out = Buffer::new();
    let mut readable = Readable::new(MemorySource::new(data.clone()), options(16)).unwrap();
    let sink = MemorySink::new(out.clone()).with_max_write(7);
    let mut writable = Writable::new(sink, options(8)).unwrap();

    pipe(&mut readable, &mut writable).await.unwrap();
    assert_eq!(&*out.lock(), data.as_slice());
}

#[tokio::test]
async fn test_hash_through_pipe() {
    let sink = HashSink::new();
    let digest = sink.digest_handle();
    let source = MemorySource::new("hello world").with_chunk_size(2);
    let mut readable = Readable::new(source, options(4)).unwrap();
    let mut writable = Writable::new(sink, options(4)).unwrap();

    pipe(&mut readable, &mut writable).await.unwrap();
    assert_eq!(
        digest.hex().unwrap(),
        "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
    );
}

// Sink that fails its n-th flush and records release calls
struct FailingSink {
    fail_on: usize,
    attempts: usize,
    releases: Arc<Mutex<Vec<Option<String>>>>,
}

impl Sink for FailingSink {
    async fn construct(&mut self) -> io::Result<()> {
        Ok(())
    }

    async fn flush(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.attempts += 1;
        if self.attempts == self.fail_on {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink closed"));
        }
        Ok(bytes.len())
    }

    async fn release(&mut self, error: Option<&StreamError>) -> io::Result<()> {
        self.releases
            .lock()
            .unwrap()
            .push(error.map(ToString::to_string));
        Ok(())
    }
}

// Source that yields a few chunks, then fails
struct FailingSource {
    chunks_before_failure: usize,
    closes: Arc<Mutex<usize>>,
}

impl Source for FailingSource {
    async fn open(&mut self) -> io::Result<()> {
        Ok(())
    }

    async fn read_next(&mut self, _max_len: usize) -> io::Result<Option<Bytes>> {
        if self.chunks_before_failure == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated"));
        }
        self.chunks_before_failure -= 1;
        Ok(Some(Bytes::from_static(b"chunk")))
    }

    async fn close(&mut self) -> io::Result<()> {
        *self.closes.lock().unwrap() += 1;
        Ok(())
    }
}

#[tokio::test]
async fn test_sink_failure_aborts_readable() {
    init_logging();
    let releases = Arc::new(Mutex::new(Vec::new()));
    let closes = Arc::new(Mutex::new(0));
    let source = FailingSource {
        chunks_before_failure: 100,
        closes: closes.clone(),
    };
    let sink = FailingSink {
        fail_on: 2,
        attempts: 0,
        releases: releases.clone(),
    };
    let mut readable = Readable::new(source, options(8)).unwrap();
    let mut writable = Writable::new(sink, options(8)).unwrap();

    let err = pipe(&mut readable, &mut writable).await.unwrap_err();
    assert_eq!(err.side, PipeSide::Writable);
    assert!(matches!(err.cause, StreamError::SinkWrite(_)));
    assert!(err.abort.is_none());

    assert_eq!(writable.state(), StreamState::Errored);
    assert_eq!(readable.state(), StreamState::Errored);
    assert!(matches!(readable.error(), Some(StreamError::SinkWrite(_))));
    assert_eq!(
        readable.read().await.unwrap_err().io_kind(),
        Some(io::ErrorKind::BrokenPipe)
    );
    assert_eq!(*closes.lock().unwrap(), 1);
    assert_eq!(releases.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_source_failure_aborts_writable() {
    let releases = Arc::new(Mutex::new(Vec::new()));
    let closes = Arc::new(Mutex::new(0));
    let source = FailingSource {
        chunks_before_failure: 3,
        closes: closes.clone(),
    };
    let sink = FailingSink {
        fail_on: usize::MAX,
        attempts: 0,
        releases: releases.clone(),
    };
    let mut readable = Readable::new(source, options(64)).unwrap();
    let mut writable = Writable::new(sink, options(64)).unwrap();

    let err = pipe(&mut readable, &mut writable).await.unwrap_err();
    assert_eq!(err.side, PipeSide::Readable);
    assert_eq!(err.cause.io_kind(), Some(io::ErrorKind::UnexpectedEof));
    assert!(err.to_string().starts_with("pipe failed on the readable side"));

    assert_eq!(readable.state(), StreamState::Errored);
    assert_eq!(writable.state(), StreamState::Errored);
    assert!(!writable.is_finished());
    assert!(matches!(writable.error(), Some(StreamError::SourceRead(_))));
    assert!(matches!(writable.write("late"), Err(StreamError::SourceRead(_))));
    assert_eq!(*closes.lock().unwrap(), 1);

    let releases = releases.lock().unwrap();
    assert_eq!(releases.len(), 1);
    assert_eq!(
        releases[0].as_deref(),
        Some("source read failed: truncated")
    );
}
