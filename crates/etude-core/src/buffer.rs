// src/buffer.rs
//! Fixed-capacity per-connection buffers.
//!
//! Both buffers are allocated once per connection and reused across
//! keep-alive requests; a reset only rewinds the cursors.

use std::fmt;
use std::ops::Range;
use thiserror::Error;

pub const READ_BUFFER_SIZE: usize = 2048;
pub const WRITE_BUFFER_SIZE: usize = 1024;

/// Read side of a connection.
///
/// Invariant: `start_line <= checked_idx <= read_idx <= capacity`.
/// `read_idx` counts bytes received, `checked_idx` bytes already scanned for
/// line boundaries, `start_line` the first byte of the line being parsed.
pub struct ReadBuf {
    buf: Box<[u8]>,
    read_idx: usize,
    checked_idx: usize,
    start_line: usize,
}

impl ReadBuf {
    pub fn new() -> Self {
        Self::with_capacity(READ_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity].into_boxed_slice(),
            read_idx: 0,
            checked_idx: 0,
            start_line: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn read_idx(&self) -> usize {
        self.read_idx
    }

    #[inline]
    pub fn checked_idx(&self) -> usize {
        self.checked_idx
    }

    #[inline]
    pub fn start_line(&self) -> usize {
        self.start_line
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.read_idx == self.buf.len()
    }

    /// Room left for the next read.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.read_idx
    }

    /// Received but not yet scanned.
    #[inline]
    pub fn unchecked(&self) -> usize {
        self.read_idx - self.checked_idx
    }

    /// Bytes received so far.
    pub fn filled(&self) -> &[u8] {
        &self.buf[..self.read_idx]
    }

    /// Writable tail for the next socket read; follow with [`ReadBuf::commit`].
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.read_idx..]
    }

    /// Record `n` freshly read bytes. Clamped to capacity.
    pub fn commit(&mut self, n: usize) {
        debug_assert!(n <= self.remaining());
        self.read_idx = (self.read_idx + n).min(self.buf.len());
    }

    /// Append bytes directly (tests and in-process feeding). Returns how many fit.
    pub fn extend(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.remaining());
        self.buf[self.read_idx..self.read_idx + n].copy_from_slice(&data[..n]);
        self.read_idx += n;
        n
    }

    #[inline]
    pub(crate) fn byte(&self, idx: usize) -> Option<u8> {
        if idx < self.read_idx {
            Some(self.buf[idx])
        } else {
            None
        }
    }

    /// Move the scan cursor to `idx`; never backwards, never past `read_idx`.
    pub(crate) fn set_checked(&mut self, idx: usize) {
        debug_assert!(idx >= self.checked_idx && idx <= self.read_idx);
        self.checked_idx = idx.clamp(self.checked_idx, self.read_idx);
    }

    /// The next line starts where scanning stopped.
    pub(crate) fn mark_line_start(&mut self) {
        self.start_line = self.checked_idx;
    }

    /// Consume `n` body bytes starting at `checked_idx`; returns their range.
    pub(crate) fn take(&mut self, n: usize) -> Option<Range<usize>> {
        if n > self.unchecked() {
            return None;
        }
        let start = self.checked_idx;
        self.checked_idx += n;
        self.start_line = self.checked_idx;
        Some(start..self.checked_idx)
    }

    pub fn slice(&self, range: Range<usize>) -> &[u8] {
        let end = range.end.min(self.read_idx);
        let start = range.start.min(end);
        &self.buf[start..end]
    }

    pub fn text(&self, range: Range<usize>) -> Option<&str> {
        std::str::from_utf8(self.slice(range)).ok()
    }

    /// Rewind all cursors. The bytes are left in place and overwritten by the
    /// next request.
    pub fn clear(&mut self) {
        self.read_idx = 0;
        self.checked_idx = 0;
        self.start_line = 0;
    }
}

impl Default for ReadBuf {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("response would overflow the {capacity}-byte write buffer")]
pub struct BufferFull {
    pub capacity: usize,
}

/// Response header buffer. Appends are all-or-nothing: an append that does
/// not fit leaves the buffer unchanged and reports [`BufferFull`].
pub struct WriteBuf {
    buf: Box<[u8]>,
    len: usize,
}

impl WriteBuf {
    pub fn new() -> Self {
        Self::with_capacity(WRITE_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> Result<(), BufferFull> {
        let end = self.len + bytes.len();
        if end > self.buf.len() {
            return Err(BufferFull {
                capacity: self.buf.len(),
            });
        }
        self.buf[self.len..end].copy_from_slice(bytes);
        self.len = end;
        Ok(())
    }

    pub fn push_fmt(&mut self, args: fmt::Arguments<'_>) -> Result<(), BufferFull> {
        let mark = self.len;
        if fmt::write(self, args).is_err() {
            self.len = mark;
            return Err(BufferFull {
                capacity: self.buf.len(),
            });
        }
        Ok(())
    }

    pub fn push_usize(&mut self, n: usize) -> Result<(), BufferFull> {
        let mut digits = itoa::Buffer::new();
        self.push(digits.format(n).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl Default for WriteBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Write for WriteBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push(s.as_bytes()).map_err(|_| fmt::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_buf_cursors() {
        let mut rb = ReadBuf::with_capacity(8);
        assert_eq!(rb.extend(b"GET /"), 5);
        assert_eq!(rb.read_idx(), 5);
        assert_eq!(rb.remaining(), 3);

        rb.set_checked(3);
        rb.mark_line_start();
        assert_eq!(rb.start_line(), 3);
        assert_eq!(rb.unchecked(), 2);

        // Only three bytes of room left.
        assert_eq!(rb.extend(b"abcdef"), 3);
        assert!(rb.is_full());

        assert_eq!(rb.take(10), None);
        assert_eq!(rb.take(5), Some(3..8));
        assert_eq!(rb.slice(3..8), b"/abcd".as_slice());

        rb.clear();
        assert_eq!(
            (rb.read_idx(), rb.checked_idx(), rb.start_line()),
            (0, 0, 0)
        );
    }

    #[test]
    fn test_commit_is_clamped() {
        let mut rb = ReadBuf::with_capacity(4);
        rb.spare_mut()[..2].copy_from_slice(b"hi");
        rb.commit(2);
        assert_eq!(rb.filled(), b"hi");
        assert_eq!(rb.byte(1), Some(b'i'));
        assert_eq!(rb.byte(2), None);
    }

    #[test]
    fn test_write_buf_is_all_or_nothing() {
        let mut wb = WriteBuf::with_capacity(16);
        wb.push(b"HTTP/1.1 ").unwrap();
        wb.push_usize(200).unwrap();
        assert_eq!(wb.as_bytes(), b"HTTP/1.1 200");

        let err = wb.push_fmt(format_args!(" {}\r\n", "Not Found")).unwrap_err();
        assert_eq!(err.capacity, 16);
        assert_eq!(wb.as_bytes(), b"HTTP/1.1 200");

        wb.push_fmt(format_args!(" OK")).unwrap();
        assert_eq!(wb.len(), 15);
        wb.clear();
        assert!(wb.is_empty());
    }
}
