//! Per-connection outbound buffer.
//!
//! Replies are appended at the back and drained from the front as the
//! socket accepts bytes. A partial write leaves the unsent suffix in place
//! for the next write-ready event, so bytes are delivered in append order
//! exactly once.
//!
//! The buffer is bounded: an append that would exceed `limit` is refused and
//! the caller disconnects the slow consumer.

use bytes::{Buf, BytesMut};
use std::fmt;
use std::io::{self, Write};

/// Returned when an append would push queued output past the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferFull {
    /// Bytes already queued.
    pub queued: usize,
    /// Bytes the refused append carried.
    pub incoming: usize,
    /// Configured limit.
    pub limit: usize,
}

impl fmt::Display for BufferFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "outbound buffer full: {} queued + {} incoming > {} limit",
            self.queued, self.incoming, self.limit
        )
    }
}

impl std::error::Error for BufferFull {}

impl From<BufferFull> for io::Error {
    fn from(e: BufferFull) -> Self {
        io::Error::new(io::ErrorKind::OutOfMemory, e)
    }
}

/// Bytes queued for send on one connection.
#[derive(Debug)]
pub struct OutboundBuffer {
    data: BytesMut,
    limit: usize,
}

impl OutboundBuffer {
    /// Create an empty buffer that refuses to hold more than `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            data: BytesMut::new(),
            limit,
        }
    }

    /// Queue bytes at the back of the buffer.
    pub fn push(&mut self, bytes: &[u8]) -> Result<(), BufferFull> {
        if self.data.len() + bytes.len() > self.limit {
            return Err(BufferFull {
                queued: self.data.len(),
                incoming: bytes.len(),
                limit: self.limit,
            });
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Write queued bytes until the buffer is empty or the writer would block.
    ///
    /// Returns the number of bytes written. Whatever the writer did not take
    /// stays queued. A writer that accepts zero bytes is treated as a hard
    /// error.
    pub fn drain_into<W: Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let mut total = 0;
        while !self.data.is_empty() {
            match writer.write(&self.data) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => {
                    self.data.advance(n);
                    total += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Bytes still queued.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The queued bytes, front first.
    #[cfg(test)]
    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.data
    }
}
