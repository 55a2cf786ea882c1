use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};

/// A chunk of process output and when it arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedChunk {
    /// Arrival time.
    pub at: DateTime<Utc>,
    /// Raw bytes, in stream order.
    pub data: Bytes,
}

/// Append-only byte log with a size cap.
///
/// Once the cap is exceeded the oldest bytes are dropped; the dropped count
/// is kept so callers can tell the log is no longer complete.
#[derive(Debug)]
pub(crate) struct OutputBuffer {
    chunks: VecDeque<TimedChunk>,
    len: usize,
    cap: usize,
    dropped: u64,
}

impl OutputBuffer {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            len: 0,
            cap: cap.max(1),
            dropped: 0,
        }
    }

    pub(crate) fn push(&mut self, data: Bytes) {
        self.push_at(Utc::now(), data);
    }

    fn push_at(&mut self, at: DateTime<Utc>, mut data: Bytes) {
        if data.is_empty() {
            return;
        }
        if data.len() >= self.cap {
            self.dropped += (self.len + data.len() - self.cap) as u64;
            self.chunks.clear();
            data = data.slice(data.len() - self.cap..);
            self.len = 0;
        }
        self.len += data.len();
        self.chunks.push_back(TimedChunk { at, data });

        while self.len > self.cap {
            let excess = self.len - self.cap;
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            if front.data.len() <= excess {
                let removed = front.data.len();
                self.chunks.pop_front();
                self.len -= removed;
                self.dropped += removed as u64;
            } else {
                front.data = front.data.slice(excess..);
                self.len -= excess;
                self.dropped += excess as u64;
            }
        }
    }

    /// Retained bytes, oldest first.
    pub(crate) fn bytes(&self) -> Bytes {
        if self.chunks.len() == 1 {
            if let Some(only) = self.chunks.front() {
                return only.data.clone();
            }
        }
        let mut out = BytesMut::with_capacity(self.len);
        for chunk in &self.chunks {
            out.extend_from_slice(&chunk.data);
        }
        out.freeze()
    }

    pub(crate) fn chunks(&self) -> Vec<TimedChunk> {
        self.chunks.iter().cloned().collect()
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped
    }

    pub(crate) fn is_truncated(&self) -> bool {
        self.dropped > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keeps_order_under_cap() {
        let mut buffer = OutputBuffer::new(64);
        buffer.push(Bytes::from_static(b"hello "));
        buffer.push(Bytes::from_static(b"world"));
        assert_eq!(buffer.bytes(), Bytes::from_static(b"hello world"));
        assert!(!buffer.is_truncated());
        assert_eq!(buffer.chunks().len(), 2);
    }

    #[test]
    fn test_drops_oldest_bytes_on_overflow() {
        let mut buffer = OutputBuffer::new(8);
        buffer.push(Bytes::from_static(b"abcdef"));
        buffer.push(Bytes::from_static(b"ghij"));
        assert_eq!(buffer.bytes(), Bytes::from_static(b"cdefghij"));
        assert_eq!(buffer.dropped(), 2);
        assert!(buffer.is_truncated());
    }

    #[test]
    fn test_oversized_chunk_keeps_its_tail() {
        let mut buffer = OutputBuffer::new(4);
        buffer.push(Bytes::from_static(b"xy"));
        buffer.push(Bytes::from_static(b"0123456789"));
        assert_eq!(buffer.bytes(), Bytes::from_static(b"6789"));
        assert_eq!(buffer.dropped(), 8);
    }

    #[test]
    fn test_whole_chunks_are_evicted() {
        let mut buffer = OutputBuffer::new(5);
        buffer.push(Bytes::from_static(b"aa"));
        buffer.push(Bytes::from_static(b"bb"));
        buffer.push(Bytes::from_static(b"ccc"));
        assert_eq!(buffer.bytes(), Bytes::from_static(b"bbccc"));
        assert_eq!(buffer.chunks().len(), 2);
        assert_eq!(buffer.dropped(), 2);
    }

    #[test]
    fn test_empty_pushes_are_ignored() {
        let mut buffer = OutputBuffer::new(5);
        buffer.push(Bytes::new());
        assert!(buffer.chunks().is_empty());
        assert!(buffer.bytes().is_empty());
    }
}
