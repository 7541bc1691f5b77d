//! Backpressure-aware streaming I/O
//!
//! [`Readable`] pulls chunks from a [`io::Source`], [`Writable`] pushes
//! chunks into a [`io::Sink`], and [`pipe`] connects the two while honouring
//! both watermarks. Each stream runs its resource on a tokio worker task and
//! reports `data`/`end`/`drain`/`finish`/`error` through [`signal`] channels.

pub mod config;
pub mod error;
pub mod idgen;
pub mod io;
pub mod pipe;
pub mod readable;
pub mod signal;
pub mod state;
pub mod writable;

pub use config::{StreamOptions, DEFAULT_HIGH_WATER_MARK};
pub use error::{PipeError, PipeSide, StreamError};
pub use idgen::{Handle, IdGen};

// Re-export stream types for convenience
pub use pipe::{pipe, Pipe, PipeStats};
pub use readable::Readable;
pub use signal::{ReadableEvent, SignalHub, WritableEvent};
pub use state::StreamState;
pub use writable::Writable;
