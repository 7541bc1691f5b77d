//! Extension contract for sources and sinks
//!
//! Implement [`Source`] or [`Sink`] to plug any resource into `Readable` or
//! `Writable`. The streams own all flow control: implementations only move
//! bytes and manage their resource.
//!
//! Every method runs on the stream's worker task, one call at a time and in
//! request order, so implementations never see concurrent calls.

use bytes::Bytes;
use std::future::Future;
use std::io;

use crate::error::StreamError;

/// A producer of byte chunks
pub trait Source: Send + 'static {
    /// Acquire the underlying resource. Called once, before the first read.
    fn open(&mut self) -> impl Future<Output = io::Result<()>> + Send;

    /// Produce the next chunk of at most `max_len` bytes
    ///
    /// Returns `Ok(None)` when the source is exhausted. An empty chunk is
    /// allowed and is skipped by the stream.
    fn read_next(&mut self, max_len: usize)
        -> impl Future<Output = io::Result<Option<Bytes>>> + Send;

    /// Release the resource. Called exactly once, even if `open` failed.
    fn close(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

/// A consumer of byte chunks
pub trait Sink: Send + 'static {
    /// Acquire the underlying resource. Called once, before the first flush.
    fn construct(&mut self) -> impl Future<Output = io::Result<()>> + Send;

    /// Write a prefix of `bytes`, returning how many bytes were accepted
    ///
    /// The stream calls again with the remainder until everything is
    /// written. Accepting zero bytes of a non-empty slice is treated as a
    /// hard failure.
    fn flush(&mut self, bytes: &[u8]) -> impl Future<Output = io::Result<usize>> + Send;

    /// Release the resource. Called exactly once, with the error that
    /// terminated the stream if there was one.
    fn release(&mut self, error: Option<&StreamError>)
        -> impl Future<Output = io::Result<()>> + Send;
}
