use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

/// FIFO byte rope.
///
/// Chunks are queued as-is; a head offset makes dequeueing cheap. The
/// head chunks are merged only when a requested span crosses chunk
/// boundaries, so aligned traffic never copies.
pub struct Buffer {
    chunks: VecDeque<Bytes>,
    offset: usize,
    total: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    pub fn new() -> Self {
        Buffer {
            chunks: VecDeque::new(),
            offset: 0,
            total: 0,
        }
    }

    /// Unconsumed length.
    pub fn len(&self) -> usize {
        self.total - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn enqueue(&mut self, data: Bytes) {
        if !data.is_empty() {
            self.total += data.len();
            self.chunks.push_back(data);
        }
    }

    /// Up to `size` bytes from the head, without consuming them.
    pub fn slice(&mut self, size: usize) -> Bytes {
        let want = size.min(self.len());
        if want == 0 {
            return Bytes::new();
        }
        let span = self.offset + want;
        if self.chunks[0].len() >= span {
            return self.chunks[0].slice(self.offset..span);
        }

        // The span crosses chunk boundaries: merge just enough head
        // chunks into one and re-queue it.
        let mut merged = BytesMut::new();
        let mut merged_len = 0;
        while merged_len < span {
            let chunk = self.chunks.pop_front().expect("span is within total");
            merged_len += chunk.len();
            merged.extend_from_slice(&chunk);
        }
        let merged = merged.freeze();
        self.chunks.push_front(merged.clone());
        merged.slice(self.offset..span)
    }

    /// The whole unconsumed content, without consuming it.
    pub fn slice_all(&mut self) -> Bytes {
        let len = self.len();
        self.slice(len)
    }

    /// Consume and return up to `size` bytes.
    pub fn dequeue(&mut self, size: usize) -> Bytes {
        let out = self.slice(size);
        self.advance(out.len());
        out
    }

    /// Consume and return everything.
    pub fn dequeue_all(&mut self) -> Bytes {
        let len = self.len();
        self.dequeue(len)
    }

    /// Consume `size` bytes without returning them (the flush path
    /// already holds the written slice).
    pub fn advance(&mut self, size: usize) {
        self.offset += size.min(self.len());
        while let Some(front) = self.chunks.front() {
            if self.offset < front.len() {
                break;
            }
            self.offset -= front.len();
            self.total -= front.len();
            self.chunks.pop_front();
        }
        if self.chunks.is_empty() {
            debug_assert_eq!(self.offset, 0);
            debug_assert_eq!(self.total, 0);
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Buffer(len:{}, chunks:{})", self.len(), self.chunks.len())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_aligned_dequeue_does_not_merge() {
        let mut buffer = Buffer::new();
        buffer.enqueue(Bytes::from_static(b"hello"));
        buffer.enqueue(Bytes::from_static(b"world"));
        assert_eq!(buffer.len(), 10);

        assert_eq!(buffer.dequeue(5), Bytes::from_static(b"hello"));
        assert_eq!(buffer.dequeue(5), Bytes::from_static(b"world"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_cross_boundary_slice_merges_head() {
        let mut buffer = Buffer::new();
        buffer.enqueue(Bytes::from_static(b"ab"));
        buffer.enqueue(Bytes::from_static(b"cd"));
        buffer.enqueue(Bytes::from_static(b"ef"));

        assert_eq!(buffer.slice(3), Bytes::from_static(b"abc"));
        // Peeking does not consume.
        assert_eq!(buffer.len(), 6);
        assert_eq!(buffer.dequeue(3), Bytes::from_static(b"abc"));
        assert_eq!(buffer.dequeue_all(), Bytes::from_static(b"def"));
    }

    #[test]
    fn test_offset_survives_partial_dequeues() {
        let mut buffer = Buffer::new();
        buffer.enqueue(Bytes::from_static(b"0123456789"));
        assert_eq!(buffer.dequeue(3), Bytes::from_static(b"012"));
        assert_eq!(buffer.dequeue(3), Bytes::from_static(b"345"));
        buffer.enqueue(Bytes::from_static(b"ab"));
        assert_eq!(buffer.dequeue_all(), Bytes::from_static(b"6789ab"));
    }

    #[test]
    fn test_advance_drops_without_copying_out() {
        let mut buffer = Buffer::new();
        buffer.enqueue(Bytes::from_static(b"head"));
        buffer.enqueue(Bytes::from_static(b"tail"));
        buffer.advance(6);
        assert_eq!(buffer.dequeue_all(), Bytes::from_static(b"il"));
    }

    #[test]
    fn test_oversized_requests_are_clamped() {
        let mut buffer = Buffer::new();
        buffer.enqueue(Bytes::from_static(b"xy"));
        assert_eq!(buffer.dequeue(100), Bytes::from_static(b"xy"));
        assert_eq!(buffer.dequeue(100), Bytes::new());
        buffer.advance(100); // no-op on empty
    }
}
