//! Shared byte storage with internal locking
//!
//! Backs the in-memory source and sink: a test or a caller keeps one clone,
//! the stream's worker task holds another.

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// Read-only guard to buffer contents
///
/// Holds the lock and provides read-only access to the underlying data.
/// The lock is released when the guard is dropped.
pub struct BufferReadGuard<'a>(MutexGuard<'a, Vec<u8>>);

impl Deref for BufferReadGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for BufferReadGuard<'_> {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Shared growable byte buffer
///
/// Clones share the same data. All operations lock a `parking_lot::Mutex`
/// for their duration only, except `lock()` which returns a guard.
///
/// # Example
///
/// ```
/// use flowio::io::Buffer;
///
/// let buffer = Buffer::new();
/// buffer.append(b"hello");
///
/// let guard = buffer.lock();
/// assert_eq!(&*guard, b"hello");
/// ```
#[derive(Clone, Default)]
pub struct Buffer(Arc<Mutex<Vec<u8>>>);

impl Buffer {
    /// Create a new empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append data to the buffer
    pub fn append(&self, data: &[u8]) {
        self.0.lock().extend_from_slice(data);
    }

    /// Get the current length of the buffer
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// Check if the buffer is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    /// Copy the whole contents out
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.0.lock())
    }

    /// Lock the buffer for reading
    ///
    /// The lock is held until the guard is dropped.
    #[must_use]
    pub fn lock(&self) -> BufferReadGuard<'_> {
        BufferReadGuard(self.0.lock())
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Buffer(len={})", self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_buffer_is_empty() {
        let buffer = Buffer::new();
        assert!(buffer.is_empty());
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn test_append_and_read() {
        let buffer = Buffer::new();
        buffer.append(b"hello");
        buffer.append(b" world");

        let guard = buffer.lock();
        assert_eq!(&*guard, b"hello world");
    }

    #[test]
    fn test_clone_shares_data() {
        let buffer1 = Buffer::new();
        let buffer2 = buffer1.clone();

        buffer1.append(b"from buffer1");

        assert_eq!(buffer2.to_bytes(), Bytes::from_static(b"from buffer1"));
    }
}
