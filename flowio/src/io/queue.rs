//! Ordered chunk queue with a cached byte total
//!
//! The unit of backpressure accounting for both stream kinds. Lives in a
//! stream's ledger and is only touched under the ledger lock.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

/// FIFO of chunks plus the sum of their lengths
#[derive(Debug, Default)]
pub struct BufferQueue {
    chunks: VecDeque<Bytes>,
    length: usize,
}

impl BufferQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk at the back
    pub fn enqueue(&mut self, chunk: Bytes) {
        self.length += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Remove the oldest chunk
    pub fn dequeue(&mut self) -> Option<Bytes> {
        let chunk = self.chunks.pop_front()?;
        self.length -= chunk.len();
        Some(chunk)
    }

    /// Total buffered bytes
    #[must_use]
    pub fn length(&self) -> usize {
        self.length
    }

    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Coalesce every buffered chunk into one
    ///
    /// A lone chunk is handed over as is; several chunks are copied into one
    /// contiguous allocation for a single bulk write.
    pub fn drain_all(&mut self) -> Bytes {
        let combined = match self.chunks.len() {
            0 => Bytes::new(),
            1 => self.chunks.pop_front().unwrap_or_default(),
            _ => {
                let mut out = BytesMut::with_capacity(self.length);
                for chunk in self.chunks.drain(..) {
                    out.extend_from_slice(&chunk);
                }
                out.freeze()
            }
        };
        self.chunks.clear();
        self.length = 0;
        combined
    }

    /// Drop everything, returning the number of discarded bytes
    pub fn clear(&mut self) -> usize {
        let discarded = self.length;
        self.chunks.clear();
        self.length = 0;
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_queue_is_empty() {
        let mut queue = BufferQueue::new();
        assert!(queue.is_empty());
        assert_eq!(queue.length(), 0);
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_fifo_order_and_length() {
        let mut queue = BufferQueue::new();
        queue.enqueue(Bytes::from_static(b"ab"));
        queue.enqueue(Bytes::from_static(b"cde"));
        assert_eq!(queue.length(), 5);
        assert_eq!(queue.chunk_count(), 2);

        assert_eq!(queue.dequeue().unwrap(), Bytes::from_static(b"ab"));
        assert_eq!(queue.length(), 3);
        assert_eq!(queue.dequeue().unwrap(), Bytes::from_static(b"cde"));
        assert_eq!(queue.length(), 0);
    }

    #[test]
    fn test_empty_chunk_counts_as_entry() {
        let mut queue = BufferQueue::new();
        queue.enqueue(Bytes::new());
        assert!(!queue.is_empty());
        assert_eq!(queue.length(), 0);
        assert_eq!(queue.dequeue().unwrap().len(), 0);
    }

    #[test]
    fn test_drain_all_concatenates() {
        let mut queue = BufferQueue::new();
        queue.enqueue(Bytes::from_static(b"Hello"));
        queue.enqueue(Bytes::from_static(b", "));
        queue.enqueue(Bytes::from_static(b"world"));

        let all = queue.drain_all();
        assert_eq!(&all[..], b"Hello, world");
        assert!(queue.is_empty());
        assert_eq!(queue.length(), 0);
    }

    #[test]
    fn test_drain_all_single_chunk_is_not_copied() {
        let chunk = Bytes::from(vec![1u8, 2, 3]);
        let ptr = chunk.as_ptr();
        let mut queue = BufferQueue::new();
        queue.enqueue(chunk);

        let all = queue.drain_all();
        assert_eq!(all.as_ptr(), ptr);
    }

    #[test]
    fn test_drain_all_empty() {
        let mut queue = BufferQueue::new();
        assert!(queue.drain_all().is_empty());
    }

    #[test]
    fn test_clear_reports_discarded() {
        let mut queue = BufferQueue::new();
        queue.enqueue(Bytes::from_static(b"1234"));
        queue.enqueue(Bytes::from_static(b"56"));
        assert_eq!(queue.clear(), 6);
        assert!(queue.is_empty());
    }
}
