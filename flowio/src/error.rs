//! Error types for streams and the pipe coordinator.
//!
//! I/O causes are kept behind `Arc` so that one failure can be returned to
//! the caller and delivered to signal subscribers at the same time.

use std::fmt;
use std::io;
use std::sync::Arc;

/// Errors produced by readable and writable streams
#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    /// The bound source failed while producing data
    #[error("source read failed: {0}")]
    SourceRead(Arc<io::Error>),

    /// The bound sink failed while accepting data
    #[error("sink write failed: {0}")]
    SinkWrite(Arc<io::Error>),

    /// Opening the source or constructing the sink failed
    #[error("resource acquisition failed: {0}")]
    ResourceAcquisition(Arc<io::Error>),

    /// Releasing the source or sink failed
    #[error("resource release failed: {0}")]
    Release(Arc<io::Error>),

    /// Programming error, such as a write after `end()`
    #[error("usage violation: {0}")]
    Usage(&'static str),

    /// Stream options are malformed or unsupported
    #[error("invalid stream options: {0}")]
    InvalidOptions(String),

    /// The stream was destroyed or its worker went away
    #[error("stream destroyed")]
    Destroyed,
}

impl StreamError {
    #[must_use]
    pub fn source_read(err: io::Error) -> Self {
        Self::SourceRead(Arc::new(err))
    }

    #[must_use]
    pub fn sink_write(err: io::Error) -> Self {
        Self::SinkWrite(Arc::new(err))
    }

    #[must_use]
    pub fn acquisition(err: io::Error) -> Self {
        Self::ResourceAcquisition(Arc::new(err))
    }

    #[must_use]
    pub fn release(err: io::Error) -> Self {
        Self::Release(Arc::new(err))
    }

    /// Usage violations are surfaced immediately and never change stream state
    #[must_use]
    pub fn is_usage(&self) -> bool {
        matches!(self, Self::Usage(_))
    }

    /// Underlying I/O error kind, if the failure came from a resource
    #[must_use]
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::SourceRead(e)
            | Self::SinkWrite(e)
            | Self::ResourceAcquisition(e)
            | Self::Release(e) => Some(e.kind()),
            Self::Usage(_) | Self::InvalidOptions(_) | Self::Destroyed => None,
        }
    }
}

/// Which end of a pipe failed first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeSide {
    Readable,
    Writable,
}

impl fmt::Display for PipeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Readable => write!(f, "readable"),
            Self::Writable => write!(f, "writable"),
        }
    }
}

/// Composite failure of a pipe transfer
///
/// `cause` is the first error observed. `abort` holds a secondary failure
/// raised while tearing down the other side, if there was one.
#[derive(Debug, Clone, thiserror::Error)]
#[error("pipe failed on the {side} side: {cause}")]
pub struct PipeError {
    pub side: PipeSide,
    #[source]
    pub cause: StreamError,
    pub abort: Option<StreamError>,
}
