//! I/O building blocks for streams
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │  Readable / Writable (flow control) │
//! │  - watermark checks                 │
//! │  - pause / resume / drain           │
//! └─────────────────────────────────────┘
//!          │ owns
//!          ▼
//! ┌─────────────────────────────────────┐
//! │  BufferQueue (accounting)           │
//! │  - ordered chunks + byte total      │
//! └─────────────────────────────────────┘
//!          │ requests over mpsc, completions back
//!          ▼
//! ┌─────────────────────────────────────┐
//! │  worker task                        │
//! │  - owns the Source or Sink          │
//! │  - one operation at a time          │
//! └─────────────────────────────────────┘
//!      ▲         ▲          ▲          ▲
//!      │         │          │          │
//!   Memory     File       Hash     AsyncRead/AsyncWrite
//! ```

pub mod adapter;
pub mod buffer;
pub mod file;
pub mod hash;
pub mod memory;
pub mod queue;
pub mod types;

pub use adapter::{AsyncReadSource, AsyncWriteSink};
pub use buffer::{Buffer, BufferReadGuard};
pub use file::{FileSink, FileSource};
pub use hash::{DigestHandle, HashSink};
pub use memory::{MemorySink, MemorySource};
pub use queue::BufferQueue;
pub use types::{Sink, Source};
