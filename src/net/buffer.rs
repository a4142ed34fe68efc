//! Receive buffer implementation
//!
//! A per-connection byte accumulator with an explicit read cursor. Incoming
//! bytes are appended at the end; the frame codec consumes from the cursor.
//! Consumed bytes are never re-read and are dropped by periodic compaction.

use bytes::{Buf, Bytes, BytesMut};

/// Consumed prefix size that triggers compaction
const COMPACT_THRESHOLD: usize = 64 * 1024;

/// Byte accumulator for one connection
#[derive(Debug, Clone, Default)]
pub struct ReceiveBuffer {
    /// Internal byte buffer
    data: BytesMut,
    /// Current read position
    read_pos: usize,
}

impl ReceiveBuffer {
    /// Create a new empty receive buffer
    pub fn new() -> Self {
        Self {
            data: BytesMut::new(),
            read_pos: 0,
        }
    }

    /// Create a receive buffer with a specific capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            read_pos: 0,
        }
    }

    /// Get the current read position
    #[inline]
    pub fn read_position(&self) -> usize {
        self.read_pos
    }

    /// Get the number of bytes not yet consumed
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.read_pos)
    }

    /// Check if there are bytes left to consume
    #[inline]
    pub fn has_remaining(&self) -> bool {
        self.remaining() > 0
    }

    /// The unconsumed bytes
    #[inline]
    pub fn unread(&self) -> &[u8] {
        &self.data[self.read_pos..]
    }

    /// Append bytes received from the backend
    pub fn extend(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Clear the buffer and reset the cursor
    pub fn clear(&mut self) {
        self.data.clear();
        self.read_pos = 0;
    }

    /// Peek a native-order u32 at the cursor without consuming it
    pub fn peek_u32_ne(&self) -> Option<u32> {
        let head = self.unread().get(..4)?;
        Some(u32::from_ne_bytes([head[0], head[1], head[2], head[3]]))
    }

    /// Position of `needle` relative to the cursor, scanning at most `limit` bytes
    pub fn find(&self, needle: u8, limit: usize) -> Option<usize> {
        let unread = self.unread();
        let end = unread.len().min(limit);
        unread[..end].iter().position(|&b| b == needle)
    }

    /// Skip a number of bytes
    pub fn skip(&mut self, count: usize) {
        self.read_pos = (self.read_pos + count).min(self.data.len());
        self.maybe_compact();
    }

    /// Copy out `length` bytes from the cursor and consume them
    pub fn take(&mut self, length: usize) -> Bytes {
        let end = (self.read_pos + length).min(self.data.len());
        let bytes = Bytes::copy_from_slice(&self.data[self.read_pos..end]);
        self.read_pos = end;
        self.maybe_compact();
        bytes
    }

    /// Consume every unread byte
    pub fn take_all(&mut self) -> Bytes {
        let remaining = self.remaining();
        self.take(remaining)
    }

    /// Drop the consumed prefix
    pub fn compact(&mut self) {
        if self.read_pos > 0 {
            self.data.advance(self.read_pos);
            self.read_pos = 0;
        }
    }

    fn maybe_compact(&mut self) {
        if self.read_pos == self.data.len() {
            self.clear();
        } else if self.read_pos >= COMPACT_THRESHOLD {
            self.compact();
        }
    }
}

impl From<&[u8]> for ReceiveBuffer {
    fn from(slice: &[u8]) -> Self {
        let mut buffer = Self::with_capacity(slice.len());
        buffer.extend(slice);
        buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extend_and_take() {
        let mut buf = ReceiveBuffer::new();
        buf.extend(b"Hello");
        buf.extend(b" World");

        assert_eq!(buf.remaining(), 11);
        assert_eq!(&buf.take(5)[..], b"Hello");
        assert_eq!(buf.unread(), b" World");
        assert_eq!(buf.read_position(), 5);
    }

    #[test]
    fn test_take_all_resets() {
        let mut buf = ReceiveBuffer::from(&b"abc"[..]);
        assert_eq!(&buf.take_all()[..], b"abc");
        assert!(!buf.has_remaining());
        assert_eq!(buf.read_position(), 0);
    }

    #[test]
    fn test_peek_u32() {
        let mut buf = ReceiveBuffer::new();
        buf.extend(&[1, 2, 3]);
        assert_eq!(buf.peek_u32_ne(), None);

        buf.extend(&[4]);
        assert_eq!(buf.peek_u32_ne(), Some(u32::from_ne_bytes([1, 2, 3, 4])));
        // Peeking does not consume
        assert_eq!(buf.remaining(), 4);
    }

    #[test]
    fn test_find_respects_limit() {
        let buf = ReceiveBuffer::from(&b"abc\0def"[..]);
        assert_eq!(buf.find(0, 16), Some(3));
        assert_eq!(buf.find(0, 3), None);
        assert_eq!(buf.find(b'x', 16), None);
    }

    #[test]
    fn test_cursor_never_rereads() {
        let mut buf = ReceiveBuffer::from(&b"one\0two\0"[..]);
        let first = buf.find(0, 64).unwrap();
        assert_eq!(&buf.take(first)[..], b"one");
        buf.skip(1);

        assert_eq!(buf.find(0, 64), Some(3));
        assert_eq!(&buf.take(3)[..], b"two");
    }

    #[test]
    fn test_compaction_keeps_unread() {
        let mut buf = ReceiveBuffer::new();
        buf.extend(&vec![7u8; COMPACT_THRESHOLD]);
        buf.extend(b"tail");

        buf.skip(COMPACT_THRESHOLD);
        // The consumed prefix is gone, the cursor restarted at zero
        assert_eq!(buf.read_position(), 0);
        assert_eq!(buf.unread(), b"tail");
    }

    #[test]
    fn test_skip_clamps() {
        let mut buf = ReceiveBuffer::from(&b"ab"[..]);
        buf.skip(10);
        assert_eq!(buf.remaining(), 0);
    }
}
