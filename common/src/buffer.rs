//! PDU Buffer
//!
//! Owned byte buffer with a movable data window. Headers are prepended into
//! reserved headroom and stripped by advancing the window start, so payload
//! bytes are never shifted in memory.

use bytes::Bytes;
use std::fmt;
use thiserror::Error;

/// Headroom reserved in front of a PDU payload.
///
/// Covers the largest data PDU header: 2 fixed bytes plus 128 length
/// indicators at 1.5 bytes each.
pub const PDU_HEADROOM: usize = 194;

/// Buffer window errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("Insufficient headroom: {needed} bytes needed, {available} available")]
    InsufficientHeadroom { needed: usize, available: usize },

    #[error("Buffer underflow: {requested} bytes requested, {available} available")]
    Underflow { requested: usize, available: usize },
}

/// Byte buffer with a `(head, len)` view into owned storage
#[derive(Clone, Default, PartialEq, Eq)]
pub struct PduBuffer {
    data: Vec<u8>,
    head: usize,
}

impl PduBuffer {
    /// Create an empty buffer with `headroom` bytes reserved for prepending
    pub fn with_headroom(headroom: usize, capacity: usize) -> Self {
        let mut data = Vec::with_capacity(headroom + capacity);
        data.resize(headroom, 0);
        Self { data, head: headroom }
    }

    /// Create a buffer holding a copy of `bytes` with no headroom
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec(),
            head: 0,
        }
    }

    /// Number of bytes in the data window
    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    /// Whether the data window is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes available in front of the data window
    pub fn headroom(&self) -> usize {
        self.head
    }

    /// View of the data window
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.head..]
    }

    /// Append bytes at the tail of the data window
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Grow the data window `n` bytes towards the front and return the new
    /// leading bytes for the caller to fill in
    pub fn prepend(&mut self, n: usize) -> Result<&mut [u8], BufferError> {
        if n > self.head {
            return Err(BufferError::InsufficientHeadroom {
                needed: n,
                available: self.head,
            });
        }
        self.head -= n;
        Ok(&mut self.data[self.head..self.head + n])
    }

    /// Drop `n` bytes from the front of the data window
    pub fn advance(&mut self, n: usize) -> Result<(), BufferError> {
        if n > self.len() {
            return Err(BufferError::Underflow {
                requested: n,
                available: self.len(),
            });
        }
        self.head += n;
        Ok(())
    }

    /// Release the window contents, keeping the allocation
    pub fn clear(&mut self) {
        self.data.truncate(self.head);
    }

    /// Convert the data window into `Bytes` without copying
    pub fn freeze(self) -> Bytes {
        let head = self.head;
        Bytes::from(self.data).slice(head..)
    }
}

impl fmt::Debug for PduBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PduBuffer")
            .field("headroom", &self.head)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepend_keeps_payload_in_place() {
        let mut buf = PduBuffer::with_headroom(4, 8);
        buf.extend_from_slice(&[0xAA, 0xBB]);
        buf.prepend(2).unwrap().copy_from_slice(&[0x01, 0x02]);
        assert_eq!(buf.as_slice(), &[0x01, 0x02, 0xAA, 0xBB]);
        assert_eq!(buf.headroom(), 2);
    }

    #[test]
    fn test_prepend_beyond_headroom_fails() {
        let mut buf = PduBuffer::with_headroom(1, 0);
        assert_eq!(
            buf.prepend(2),
            Err(BufferError::InsufficientHeadroom { needed: 2, available: 1 })
        );
    }

    #[test]
    fn test_advance_and_freeze() {
        let mut buf = PduBuffer::from_slice(&[1, 2, 3, 4, 5]);
        buf.advance(3).unwrap();
        assert_eq!(buf.as_slice(), &[4, 5]);
        assert!(buf.advance(3).is_err());
        assert_eq!(buf.clone().freeze(), Bytes::from_static(&[4, 5]));
        buf.clear();
        assert!(buf.is_empty());
    }
}
